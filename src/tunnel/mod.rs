//! The relay tunnel codec.
//!
//! Carries one HTTP request through the relay's own HTTP interface and
//! hands back the tunneled response. The request's method, URL, and
//! headers travel as a compressed metadata block, either base64-encoded
//! in a cookie (obfuscated mode) or length-prefixed ahead of the body
//! in a single POST. The relay's own status is kept separate from the
//! tunneled status throughout; downgrade signals it carries mutate the
//! shared [`RelayState`] and the caller retries.

pub mod body;
pub mod framing;
pub mod metadata;
pub mod state;

pub use body::TunnelBody;
pub use state::{RelayEndpoint, RelayState};

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, COOKIE, HOST};
use http::{Method, StatusCode};
use log::debug;
use rand::seq::IndexedRandom;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

use crate::config::{RelayOptions, RelayScheme, MAX_DEFLATE_BODY_BYTES};
use crate::error_handling::TunnelError;
use crate::http::{content_length, read_response_head, write_request_head, BufferedStream};
use crate::racer::{ConnectionRacer, RaceStream};
use crate::resolver::HostResolver;

/// Body reader type produced by a fetch.
pub type RelayBody = TunnelBody<BufferedStream<RaceStream>>;

/// The tunneled response, with the relay's own status kept alongside.
#[derive(Debug)]
pub struct TunnelResponse {
    /// What the relay itself answered. Downgrade handling keys off this.
    pub relay_status: StatusCode,
    /// Status of the tunneled fetch. Equals `relay_status` when the
    /// relay did not answer 200 and no frame was present.
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: RelayBody,
}

pub struct RelayTunnel {
    resolver: Arc<HostResolver>,
    racer: Arc<ConnectionRacer>,
    state: Arc<RelayState>,
}

/// A fully encoded outbound relay request.
struct WireRequest {
    method: Method,
    target: String,
    headers: HeaderMap,
    payload: Bytes,
    xor_key: Option<u8>,
}

impl RelayTunnel {
    pub fn new(
        resolver: Arc<HostResolver>,
        racer: Arc<ConnectionRacer>,
        state: Arc<RelayState>,
    ) -> Self {
        RelayTunnel {
            resolver,
            racer,
            state,
        }
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    /// Fetches `url` through the currently active relay identity.
    pub async fn fetch(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<TunnelResponse, TunnelError> {
        let endpoint = self.state.endpoint();
        self.fetch_via(&endpoint, method, url, headers, body).await
    }

    /// Fetches `url` through a specific relay endpoint. Range workers
    /// use this with their round-robin pick.
    pub async fn fetch_via(
        &self,
        endpoint: &RelayEndpoint,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<TunnelResponse, TunnelError> {
        let quirk = endpoint.scheme == RelayScheme::Http && self.state.quirk_active();
        let wire = encode_request(self.state.options(), endpoint, method, url, headers, body)?;

        let (relay_host, port) = split_authority(&endpoint.host, endpoint.scheme)?;
        let ips = self.resolver.resolve(&relay_host).await?;
        let addrs: Vec<SocketAddr> = ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect();

        let raw = match endpoint.scheme {
            RelayScheme::Https => RaceStream::Tls(Box::new(
                self.racer.connect_tls(&relay_host, &addrs).await?,
            )),
            RelayScheme::Http => RaceStream::Plain(self.racer.connect(&addrs).await?),
        };
        let mut stream = BufferedStream::new(Bytes::new(), raw);

        let mut head = BytesMut::new();
        if quirk {
            head.extend_from_slice(framing::QUIRK_PREAMBLE);
        }
        head.extend_from_slice(&write_request_head(&wire.method, &wire.target, &wire.headers));
        stream.write_all(&head).await?;
        if !wire.payload.is_empty() {
            stream.write_all(&wire.payload).await?;
        }
        stream.flush().await?;

        if quirk {
            discard_one_response(&mut stream).await?;
        }

        let (relay_head, leftover) = read_response_head(&mut stream).await?;
        stream.prepend(leftover);
        let relay_status = relay_head.status;
        if self.state.apply_relay_status(relay_status.as_u16()) {
            debug!("relay {} triggered a downgrade ({relay_status})", endpoint.host);
        }

        if relay_status != StatusCode::OK {
            let limit = content_length(&relay_head.headers);
            return Ok(TunnelResponse {
                relay_status,
                status: relay_status,
                headers: relay_head.headers,
                body: TunnelBody::new(stream, limit, None),
            });
        }

        let (frame_status, frame_len, mut headers) = framing::read_frame(&mut stream).await?;
        let status_value = headers
            .remove("x-status")
            .and_then(|v| v.to_str().ok().and_then(|v| v.parse::<u16>().ok()))
            .unwrap_or(frame_status);
        let status = StatusCode::from_u16(status_value).map_err(|_| {
            TunnelError::MalformedResponse(format!("tunneled status {status_value} out of range"))
        })?;

        // what the relay declared, minus the frame bytes already read
        let limit =
            content_length(&relay_head.headers).map(|total| total.saturating_sub(frame_len));
        Ok(TunnelResponse {
            relay_status,
            status,
            headers,
            body: TunnelBody::new(stream, limit, wire.xor_key),
        })
    }
}

/// Builds the wire request: body compression, metadata block, and the
/// outer envelope for the selected transport mode.
fn encode_request(
    options: &RelayOptions,
    endpoint: &RelayEndpoint,
    method: &Method,
    url: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<WireRequest, TunnelError> {
    let mut inner = headers.clone();
    inner.remove(HOST);

    let mut body = body;
    if !body.is_empty() {
        if body.len() < MAX_DEFLATE_BODY_BYTES && !inner.contains_key(CONTENT_ENCODING) {
            let packed = framing::deflate(&body)?;
            if packed.len() < body.len() {
                body = Bytes::from(packed);
                inner.insert(CONTENT_ENCODING, HeaderValue::from_static("deflate"));
            }
        }
        inner.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    }

    let mut opts: Vec<(&str, String)> = Vec::new();
    if let Some(password) = options.password.as_deref() {
        if !password.is_empty() {
            opts.push(("password", password.to_string()));
        }
    }
    if options.validate {
        opts.push(("validate", "1".to_string()));
    }

    let mut target = endpoint.path.clone();
    let mut xor_key = None;
    if options.xor_obfuscation && endpoint.scheme == RelayScheme::Http {
        let key = pick_xor_key(options.password.as_deref());
        opts.push(("xorchar", (key as char).to_string()));
        // randomized query keeps middleboxes from caching the exchange
        target = format!("{target}?{}", rand::rng().random::<f64>());
        xor_key = Some(key);
    }

    let abbreviate = options.obfuscate && !inner.contains_key("x-requested-with");
    let block = metadata::encode(method, url, &opts, &inner, abbreviate);
    let packed = framing::deflate(block.as_bytes())?;

    let mut outer = HeaderMap::new();
    outer.insert(HOST, header_value(&endpoint.host)?);

    if options.obfuscate {
        outer.insert(COOKIE, header_value(&BASE64.encode(&packed))?);
        let wire_method = if body.is_empty() {
            Method::GET
        } else {
            outer.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            Method::POST
        };
        Ok(WireRequest {
            method: wire_method,
            target,
            headers: outer,
            payload: body,
            xor_key,
        })
    } else {
        let payload = framing::length_prefixed(&packed, &body)?;
        outer.insert(CONTENT_LENGTH, HeaderValue::from(payload.len()));
        Ok(WireRequest {
            method: Method::POST,
            target,
            headers: outer,
            payload,
            xor_key,
        })
    }
}

/// One byte of the shared secret, or of the fallback keyword when no
/// password is configured.
fn pick_xor_key(password: Option<&str>) -> u8 {
    let pool = match password {
        Some(p) if !p.is_empty() => p.as_bytes(),
        _ => b"relay",
    };
    let mut rng = rand::rng();
    pool.choose(&mut rng).copied().unwrap_or(b'r')
}

/// Reads and drains one complete response, handing bytes read past its
/// body back to the stream. The decoy preamble earns exactly one such
/// response ahead of the real one.
pub(crate) async fn discard_one_response<S>(stream: &mut BufferedStream<S>) -> io::Result<()>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let (head, mut leftover) = read_response_head(stream).await?;
    let body_len = content_length(&head.headers).unwrap_or(0) as usize;
    if leftover.len() >= body_len {
        stream.prepend(leftover.split_off(body_len));
        return Ok(());
    }

    let mut to_drain = body_len - leftover.len();
    let mut sink = vec![0u8; to_drain.min(8192)];
    while to_drain > 0 {
        let sink_len = sink.len();
        let n = stream.read(&mut sink[..to_drain.min(sink_len)]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "preamble response ended early",
            ));
        }
        to_drain -= n;
    }
    Ok(())
}

fn split_authority(authority: &str, scheme: RelayScheme) -> Result<(String, u16), TunnelError> {
    let parsed = Url::parse(&format!("{}://{authority}/", scheme.as_str()))
        .map_err(|err| invalid_input(format!("relay authority {authority:?}: {err}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| invalid_input(format!("relay authority {authority:?} has no host")))?
        .to_string();
    let port = parsed
        .port_or_known_default()
        .unwrap_or_else(|| scheme.default_port());
    Ok((host, port))
}

fn header_value(value: &str) -> Result<HeaderValue, TunnelError> {
    HeaderValue::try_from(value).map_err(|err| invalid_input(err.to_string()))
}

fn invalid_input(message: String) -> TunnelError {
    TunnelError::Io(io::Error::new(io::ErrorKind::InvalidInput, message))
}
