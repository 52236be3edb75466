//! Where range jobs get their bytes.
//!
//! Workers only see the [`RangeSource`] trait, so the reassembly
//! machinery is exercised in tests with a scripted source while
//! production wires in the relay tunnel.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, RANGE};
use http::{Method, StatusCode};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncRead;

use crate::error_handling::TunnelError;
use crate::tunnel::RelayTunnel;

static CONTENT_RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"bytes (\d+)-(\d+)/(\d+)").expect("content-range pattern"));

/// Parsed `Content-Range: bytes start-end/total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let caps = CONTENT_RANGE_RE.captures(value)?;
    Some(ContentRange {
        start: caps[1].parse().ok()?,
        end: caps[2].parse().ok()?,
        total: caps[3].parse().ok()?,
    })
}

/// One tunneled sub-response, reduced to what the workers act on.
pub struct RangeSlice {
    /// The relay's own status; anything but 200 requeues the job.
    pub relay_status: StatusCode,
    /// The tunneled status.
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_range: Option<ContentRange>,
    pub location: Option<String>,
    pub body: Box<dyn AsyncRead + Send + Unpin>,
}

pub trait RangeSource: Send + Sync {
    /// Fetches `url` with a `Range: bytes=start-end` header. Transport
    /// failures come back as `Err`; the caller requeues the job either
    /// way when the slice is unusable.
    fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
    ) -> impl Future<Output = Result<RangeSlice, TunnelError>> + Send;
}

/// Relay-backed source: each fetch round-robins the relay identities,
/// records how the pick answered, and carries the original request's
/// method, headers, and body.
pub struct TunnelRangeSource {
    tunnel: Arc<RelayTunnel>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
}

impl TunnelRangeSource {
    pub fn new(tunnel: Arc<RelayTunnel>, method: Method, headers: HeaderMap, body: Bytes) -> Self {
        TunnelRangeSource {
            tunnel,
            method,
            headers,
            body,
        }
    }
}

impl RangeSource for TunnelRangeSource {
    async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
    ) -> Result<RangeSlice, TunnelError> {
        let endpoint = self.tunnel.state().pick_for_range().await;
        let mut headers = self.headers.clone();
        let range_value = HeaderValue::try_from(format!("bytes={start}-{end}"))
            .map_err(|err| TunnelError::MalformedResponse(err.to_string()))?;
        headers.insert(RANGE, range_value);

        let response = self
            .tunnel
            .fetch_via(&endpoint, &self.method, url, &headers, self.body.clone())
            .await?;
        self.tunnel
            .state()
            .record_result(endpoint.index, response.relay_status.as_u16())
            .await;

        let content_range = response
            .headers
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        let location = response
            .headers
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        Ok(RangeSlice {
            relay_status: response.relay_status,
            status: response.status,
            headers: response.headers,
            content_range,
            location,
            body: Box::new(response.body),
        })
    }
}
