//! The orchestration layer above the tunnel: one entry point per proxy
//! verb, with relay pinning, autorange, bounded retries, downgrade
//! handling, and the parallel range path behind them.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use http::header::{
    HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE, SET_COOKIE, TRANSFER_ENCODING,
};
use http::{HeaderMap, Method, StatusCode};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use url::Url;

use crate::config::{ProxyConfig, FETCH_RETRIES, FORWARD_BUFSIZE, RELAY_BODY_READ_TIMEOUT_SECS};
use crate::error_handling::{
    is_client_abort, is_transient_network, ErrorKind, RangeError, TunnelError, TunnelStats,
};
use crate::forward::DirectForward;
use crate::http::{content_length, write_response_head, ClientRequest};
use crate::racer::ConnectionRacer;
use crate::range::{parse_content_range, ContentRange, RangeFetch, RangeSlice, TunnelRangeSource};
use crate::resolver::HostResolver;
use crate::tunnel::{RelayState, RelayTunnel, TunnelResponse};

static RANGE_START_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"bytes=(\d+)-").expect("range start pattern"));

/// Splits a comma-joined `Set-Cookie` value back into separate cookies.
/// The lookahead for `=` (or end of value) keeps the commas inside
/// `expires` dates intact.
static COOKIE_FOLD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r", ([^ =]+(?:=|$))").expect("cookie fold pattern"));

/// Certificate minting for a TLS-intercepting front end.
///
/// The engine never terminates client TLS itself. A host process that
/// intercepts CONNECT traffic implements this, hands the client a leaf
/// certificate for the requested hostname, and feeds the decrypted
/// stream back through [`ProxyEngine::serve_relay`].
pub trait CertificateProvider: Send + Sync {
    /// Path to a certificate bundle (leaf plus key) valid for `hostname`.
    fn certificate_for(&self, hostname: &str) -> anyhow::Result<PathBuf>;
}

/// How one streaming pass ended.
enum StreamOutcome {
    /// The response was delivered (or the client went away).
    Done,
    /// The body lapsed mid-window; the request's `Range` header now
    /// points at the first missing byte and the fetch should repeat.
    Resume,
}

/// Front door for proxied requests: owns the resolver, racer, tunnel,
/// and direct-forward paths, and picks between them per request.
pub struct ProxyEngine {
    resolver: Arc<HostResolver>,
    tunnel: Arc<RelayTunnel>,
    forward: DirectForward,
    cfg: ProxyConfig,
    stats: TunnelStats,
    relay_pinned: AtomicBool,
    pin_lock: Mutex<()>,
}

impl ProxyEngine {
    pub fn new(cfg: ProxyConfig) -> anyhow::Result<Self> {
        let resolver = Arc::new(HostResolver::new(cfg.resolver.clone()));
        let racer = Arc::new(ConnectionRacer::new(cfg.racer.clone()));
        let state = Arc::new(RelayState::new(cfg.relay.clone())?);
        let tunnel = Arc::new(RelayTunnel::new(
            resolver.clone(),
            racer.clone(),
            state.clone(),
        ));
        let forward = DirectForward::new(resolver.clone(), racer, state);
        Ok(ProxyEngine {
            resolver,
            tunnel,
            forward,
            cfg,
            stats: TunnelStats::new(),
            relay_pinned: AtomicBool::new(false),
            pin_lock: Mutex::new(()),
        })
    }

    /// Error counters, grouped by family.
    pub fn stats(&self) -> &TunnelStats {
        &self.stats
    }

    /// The shared relay state (scheme, quirk, active identity).
    pub fn state(&self) -> &RelayState {
        self.tunnel.state()
    }

    /// Resolves every relay identity once and pins the answers, so no
    /// later fetch ever re-consults DNS for a relay host. Runs at most
    /// once; concurrent callers wait for the first to finish.
    async fn ensure_relay_pinned(&self) {
        if self.relay_pinned.load(Ordering::Acquire) {
            return;
        }
        let _guard = self.pin_lock.lock().await;
        if self.relay_pinned.load(Ordering::Acquire) {
            return;
        }
        for identity in &self.cfg.relay.identities {
            let host = match Url::parse(&format!("http://{identity}/"))
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
            {
                Some(host) => host,
                None => {
                    warn!("relay identity {identity:?} has no parseable host, skipping pin");
                    continue;
                }
            };
            match self.resolver.resolve(&host).await {
                Ok(ips) => {
                    debug!("pinned relay {host} to {} addresses", ips.len());
                    self.resolver.pin(host, ips).await;
                }
                Err(err) => warn!("could not pin relay {host}: {err}"),
            }
        }
        self.relay_pinned.store(true, Ordering::Release);
    }

    /// Rewrites the request's `Range` header per the autorange policy:
    /// an explicit open-ended range is bounded to one window, and
    /// matching hosts or file types get a first window even without
    /// one. Returns whether the request now carries a bounded range.
    fn apply_autorange(&self, request: &mut ClientRequest) -> bool {
        let maxsize = self.cfg.range.maxsize;
        let existing = request
            .headers
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(value) = existing {
            let start = RANGE_START_RE
                .captures(&value)
                .and_then(|c| c[1].parse::<u64>().ok())
                .unwrap_or(0);
            let bounded = format!("bytes={start}-{}", start + maxsize - 1);
            info!("autorange {value:?} -> {bounded:?} for {}", request.url);
            if let Ok(header) = HeaderValue::try_from(bounded) {
                request.headers.insert(RANGE, header);
            }
            return true;
        }
        if self.autorange_matches(&request.url) {
            let bounded = format!("bytes=0-{}", maxsize - 1);
            info!("autorange engages {bounded:?} for {}", request.url);
            if let Ok(header) = HeaderValue::try_from(bounded) {
                request.headers.insert(RANGE, header);
            }
            return true;
        }
        false
    }

    fn autorange_matches(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let host = parsed.host_str().unwrap_or("");
        let path = parsed.path();
        let policy = &self.cfg.autorange;
        if policy
            .exclude_suffixes
            .iter()
            .any(|s| path.ends_with(s.as_str()))
        {
            return false;
        }
        policy.hosts.iter().any(|h| host.ends_with(h.as_str()))
            || policy.suffixes.iter().any(|s| path.ends_with(s.as_str()))
    }

    /// Drives one tunneled request end to end. Every attempt goes to
    /// the relay identity and scheme that are active at that moment, so
    /// downgrades triggered by one attempt steer the next. When no
    /// attempt delivered anything the client gets a 502 courtesy page.
    pub async fn serve_relay<W>(
        &self,
        mut request: ClientRequest,
        client: &mut W,
    ) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.ensure_relay_pinned().await;
        let ranged = self.apply_autorange(&mut request);

        let mut head_written = false;
        let mut errors: Vec<String> = Vec::new();
        for attempt in 0..FETCH_RETRIES {
            let last = attempt + 1 == FETCH_RETRIES;
            let response = match self
                .tunnel
                .fetch(&request.method, &request.url, &request.headers, request.body.clone())
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    self.record_tunnel_error(&err);
                    if transient_tunnel_error(&err) {
                        self.state().force_tls_only();
                    }
                    warn!("relay fetch for {} failed: {err}", request.url);
                    errors.push(err.to_string());
                    continue;
                }
            };

            if response.relay_status != StatusCode::OK {
                self.stats.record(ErrorKind::RelayStatus);
                errors.push(format!("relay answered {}", response.relay_status));
                if !last {
                    debug!("relay answered {}, retrying", response.relay_status);
                    continue;
                }
                if head_written {
                    anyhow::bail!(
                        "relay answered {} after partial delivery of {}",
                        response.relay_status,
                        request.url
                    );
                }
                info!(
                    "out of retries, handing the relay's own {} to the client",
                    response.relay_status
                );
                // fall through and stream the relay's answer verbatim
            } else if attempt == 0 && ranged && response.status == StatusCode::PARTIAL_CONTENT {
                let window = response
                    .headers
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range);
                if let Some(range) = window {
                    return self.range_fetch(&request, response, range, client).await;
                }
                // an unusable Content-Range falls through to plain streaming
            }

            match self
                .stream_response(&mut request, response, &mut head_written, client)
                .await?
            {
                StreamOutcome::Done => return Ok(()),
                StreamOutcome::Resume => {
                    errors.push("body lapsed, resuming at the missing offset".to_string());
                    continue;
                }
            }
        }

        if head_written {
            anyhow::bail!(
                "relay fetch for {} died after partial delivery: {}",
                request.url,
                errors.join("; ")
            );
        }
        let page = message_html(
            "502 fetch failed",
            &format!("relay fetch for {:?} failed", request.url),
            &errors.join("<br>\n"),
        );
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(page.len()));
        let mut out = write_response_head(StatusCode::BAD_GATEWAY, &headers);
        out.extend_from_slice(page.as_bytes());
        match client.write_all(&out).await {
            Ok(()) => {
                let _ = client.flush().await;
                Ok(())
            }
            Err(err) if is_client_abort(&err) => {
                self.stats.record(ErrorKind::ClientAbort);
                Ok(())
            }
            Err(err) => Err(err).context("writing the 502 page"),
        }
    }

    /// The non-tunneled analog of [`serve_relay`]: fetch straight from
    /// the origin, optionally dialing `realhost` instead of the URL's
    /// own host.
    pub async fn serve_direct<W>(
        &self,
        request: &ClientRequest,
        realhost: Option<&str>,
        client: &mut W,
    ) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.forward.serve(request, realhost, client).await
    }

    /// Answers a CONNECT with a raw bidirectional pump to `authority`.
    pub async fn serve_connect<C>(
        &self,
        authority: &str,
        client: C,
        mask: Option<u8>,
    ) -> anyhow::Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        self.forward.connect_pump(authority, client, mask).await
    }

    /// Hands a seeded 206 over to the parallel range path.
    async fn range_fetch<W>(
        &self,
        request: &ClientRequest,
        response: TunnelResponse,
        range: ContentRange,
        client: &mut W,
    ) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let seed = RangeSlice {
            relay_status: response.relay_status,
            status: response.status,
            headers: response.headers,
            content_range: Some(range),
            location: None,
            body: Box::new(response.body),
        };
        let mut headers = request.headers.clone();
        // workers window the range themselves
        headers.remove(RANGE);
        let source = Arc::new(TunnelRangeSource::new(
            self.tunnel.clone(),
            request.method.clone(),
            headers,
            request.body.clone(),
        ));
        let fetch = RangeFetch::new(source, &request.url, self.cfg.range.clone());
        match fetch.run(seed, client).await {
            Ok(()) => Ok(()),
            Err(RangeError::ClientWrite(err)) if is_client_abort(&err) => {
                self.stats.record(ErrorKind::ClientAbort);
                debug!("client left during a range fetch: {err}");
                Ok(())
            }
            Err(err) => {
                self.stats.record(ErrorKind::RangeAbort);
                Err(err).context("range reassembly")
            }
        }
    }

    /// Streams one tunneled response to the client. The head is written
    /// once per request, so a resumed fetch continues the body without
    /// repeating it.
    async fn stream_response<W>(
        &self,
        request: &mut ClientRequest,
        response: TunnelResponse,
        head_written: &mut bool,
        client: &mut W,
    ) -> anyhow::Result<StreamOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        let TunnelResponse {
            status,
            mut headers,
            mut body,
            ..
        } = response;
        let window = headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        let length = content_length(&headers).unwrap_or(0);
        let resumable = window.is_some() || length > 0;
        let (mut position, end) = match window {
            Some(range) => (range.start, range.end),
            None if length > 0 => (0, length - 1),
            None => (0, 0),
        };

        if !*head_written {
            headers.remove(TRANSFER_ENCODING);
            split_folded_cookies(&mut headers);
            info!("relay {} {} -> {status}", request.method, request.url);
            if let Err(err) = client.write_all(&write_response_head(status, &headers)).await {
                if is_client_abort(&err) {
                    self.stats.record(ErrorKind::ClientAbort);
                    debug!("client left before the {status} head: {err}");
                    return Ok(StreamOutcome::Done);
                }
                return Err(err).context("writing response head to client");
            }
            *head_written = true;
        }

        if request.method == Method::HEAD || matches!(status.as_u16(), 204 | 304) {
            client.flush().await.context("flushing response head")?;
            return Ok(StreamOutcome::Done);
        }

        let mut buf = vec![0u8; FORWARD_BUFSIZE];
        let read_bound = Duration::from_secs(RELAY_BODY_READ_TIMEOUT_SECS);
        loop {
            let read = match timeout(read_bound, body.read(&mut buf)).await {
                Ok(Ok(read)) => read,
                Ok(Err(err)) => {
                    if is_transient_network(&err) && resumable && position <= end {
                        self.state().force_tls_only();
                        warn!(
                            "tunneled body broke at offset {position} ({err}), resuming {}",
                            request.url
                        );
                        rewrite_resume_range(request, position, end);
                        return Ok(StreamOutcome::Resume);
                    }
                    return Err(err).context("reading tunneled body");
                }
                Err(_) => {
                    if resumable && position <= end {
                        warn!(
                            "tunneled body lapsed at offset {position}, resuming {}",
                            request.url
                        );
                        rewrite_resume_range(request, position, end);
                        return Ok(StreamOutcome::Resume);
                    }
                    anyhow::bail!("tunneled body read timed out at offset {position}");
                }
            };
            if read == 0 {
                break;
            }
            if let Err(err) = client.write_all(&buf[..read]).await {
                if is_client_abort(&err) {
                    self.stats.record(ErrorKind::ClientAbort);
                    debug!("client left mid-body: {err}");
                    return Ok(StreamOutcome::Done);
                }
                return Err(err).context("writing response body to client");
            }
            position += read as u64;
            if resumable && position > end {
                break;
            }
        }
        match client.flush().await {
            Ok(()) => Ok(StreamOutcome::Done),
            Err(err) if is_client_abort(&err) => {
                self.stats.record(ErrorKind::ClientAbort);
                Ok(StreamOutcome::Done)
            }
            Err(err) => Err(err).context("flushing response body"),
        }
    }

    fn record_tunnel_error(&self, err: &TunnelError) {
        let kind = match err {
            TunnelError::Resolve(_) => ErrorKind::Resolution,
            TunnelError::Connect(_) | TunnelError::Io(_) => ErrorKind::Connect,
            TunnelError::ShortFrame { .. }
            | TunnelError::MalformedResponse(_)
            | TunnelError::OversizedMetadata(_) => ErrorKind::TunnelFrame,
        };
        self.stats.record(kind);
    }
}

/// Transport-level failures that justify moving the relay to TLS-only
/// before the next attempt. Frame and resolution errors stay on the
/// current scheme.
fn transient_tunnel_error(err: &TunnelError) -> bool {
    match err {
        TunnelError::Connect(_) => true,
        TunnelError::Io(io_err) => is_transient_network(io_err),
        TunnelError::Resolve(_)
        | TunnelError::ShortFrame { .. }
        | TunnelError::MalformedResponse(_)
        | TunnelError::OversizedMetadata(_) => false,
    }
}

fn rewrite_resume_range(request: &mut ClientRequest, position: u64, end: u64) {
    if let Ok(value) = HeaderValue::try_from(format!("bytes={position}-{end}")) {
        request.headers.insert(RANGE, value);
    }
}

/// Relay transports fold repeated `Set-Cookie` lines into one
/// comma-joined value. Splits them back so clients see one cookie per
/// line; values that were never folded pass through untouched.
fn split_folded_cookies(headers: &mut HeaderMap) {
    let values: Vec<HeaderValue> = headers.get_all(SET_COOKIE).iter().cloned().collect();
    if values.is_empty() {
        return;
    }
    let mut rebuilt: Vec<HeaderValue> = Vec::with_capacity(values.len());
    let mut changed = false;
    for value in values {
        let Ok(text) = value.to_str() else {
            rebuilt.push(value);
            continue;
        };
        let mut from = 0;
        for found in COOKIE_FOLD_RE.find_iter(text) {
            if let Ok(part) = HeaderValue::try_from(&text[from..found.start()]) {
                rebuilt.push(part);
                changed = true;
            }
            from = found.start() + 2;
        }
        if from == 0 {
            rebuilt.push(value);
        } else if let Ok(part) = HeaderValue::try_from(&text[from..]) {
            rebuilt.push(part);
        }
    }
    if !changed {
        return;
    }
    headers.remove(SET_COOKIE);
    for value in rebuilt {
        headers.append(SET_COOKIE, value);
    }
}

const MESSAGE_TEMPLATE: &str = r#"<html><head>
<meta http-equiv="content-type" content="text/html;charset=utf-8">
<title>{{ title }}</title>
<style><!--
body {font-family: arial,sans-serif}
div.nav {margin-top: 1ex}
div.nav A {font-size: 10pt; font-family: arial,sans-serif}
span.nav {font-size: 10pt; font-family: arial,sans-serif; font-weight: bold}
div.nav A,span.big {font-size: 12pt; color: #0000cc}
div.nav A {font-size: 10pt; color: black}
A.l:link {color: #6f6f6f}
A.u:link {color: green}
//--></style>
</head>
<body text=#000000 bgcolor=#ffffff>
<table border=0 cellpadding=2 cellspacing=0 width=100%>
<tr><td bgcolor=#3366cc><font face=arial,sans-serif color=#ffffff><b>Message</b></td></tr>
<tr><td> </td></tr></table>
<blockquote>
<H1>{{ banner }}</H1>
{{ detail }}
<p>
</blockquote>
<table width=100% cellpadding=0 cellspacing=0><tr><td bgcolor=#3366cc><img alt="" width=1 height=4></td></tr></table>
</body></html>
"#;

/// Courtesy HTML page for user-visible gateway failures.
fn message_html(title: &str, banner: &str, detail: &str) -> String {
    MESSAGE_TEMPLATE
        .replace("{{ title }}", title)
        .replace("{{ banner }}", banner)
        .replace("{{ detail }}", detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    use crate::config::{AutorangeConfig, RelayOptions};

    fn engine_with(relay: RelayOptions, autorange: AutorangeConfig) -> ProxyEngine {
        ProxyEngine::new(ProxyConfig {
            relay,
            autorange,
            ..ProxyConfig::default()
        })
        .unwrap()
    }

    fn test_engine() -> ProxyEngine {
        engine_with(
            RelayOptions {
                identities: vec!["relay.test".to_string()],
                ..RelayOptions::default()
            },
            AutorangeConfig::default(),
        )
    }

    fn get(url: &str) -> ClientRequest {
        ClientRequest {
            method: Method::GET,
            url: url.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[test]
    fn autorange_bounds_an_explicit_open_range() {
        let engine = test_engine();
        let mut request = get("http://media.example/video.bin");
        request
            .headers
            .insert(RANGE, HeaderValue::from_static("bytes=100-"));

        assert!(engine.apply_autorange(&mut request));
        let maxsize = engine.cfg.range.maxsize;
        let expected = format!("bytes=100-{}", 100 + maxsize - 1);
        assert_eq!(request.headers[RANGE], expected.as_str());
    }

    #[test]
    fn autorange_engages_on_archive_paths() {
        let engine = test_engine();
        let mut request = get("http://files.example/dist/tool.zip");

        assert!(engine.apply_autorange(&mut request));
        let expected = format!("bytes=0-{}", engine.cfg.range.maxsize - 1);
        assert_eq!(request.headers[RANGE], expected.as_str());
    }

    #[test]
    fn autorange_respects_excluded_suffixes() {
        let engine = engine_with(
            RelayOptions {
                identities: vec!["relay.test".to_string()],
                ..RelayOptions::default()
            },
            AutorangeConfig {
                hosts: vec!["files.example".to_string()],
                ..AutorangeConfig::default()
            },
        );
        let mut request = get("http://files.example/api/listing.json");

        assert!(!engine.apply_autorange(&mut request));
        assert!(request.headers.get(RANGE).is_none());
    }

    #[test]
    fn autorange_leaves_plain_requests_alone() {
        let engine = test_engine();
        let mut request = get("http://site.example/page");
        assert!(!engine.apply_autorange(&mut request));
        assert!(request.headers.get(RANGE).is_none());
    }

    #[test]
    fn folded_cookies_are_split_apart() {
        let mut headers = HeaderMap::new();
        headers.insert(
            SET_COOKIE,
            HeaderValue::from_static("a=1; path=/, b=2; path=/, c=3"),
        );
        split_folded_cookies(&mut headers);
        let cookies: Vec<&str> = headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(cookies, vec!["a=1; path=/", "b=2; path=/", "c=3"]);
    }

    #[test]
    fn cookie_expiry_dates_survive_the_split() {
        let mut headers = HeaderMap::new();
        headers.insert(
            SET_COOKIE,
            HeaderValue::from_static("sid=abc; expires=Mon, 01 Jan 2024 00:00:00 GMT; path=/"),
        );
        split_folded_cookies(&mut headers);
        let cookies: Vec<&str> = headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(
            cookies,
            vec!["sid=abc; expires=Mon, 01 Jan 2024 00:00:00 GMT; path=/"]
        );
    }

    #[test]
    fn folded_cookie_with_a_date_splits_at_the_cookie_boundary() {
        let mut headers = HeaderMap::new();
        headers.insert(
            SET_COOKIE,
            HeaderValue::from_static(
                "sid=abc; expires=Mon, 01 Jan 2024 00:00:00 GMT, token=xyz; path=/",
            ),
        );
        split_folded_cookies(&mut headers);
        let cookies: Vec<&str> = headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(
            cookies,
            vec![
                "sid=abc; expires=Mon, 01 Jan 2024 00:00:00 GMT",
                "token=xyz; path=/"
            ]
        );
    }

    #[test]
    fn message_page_fills_the_template() {
        let page = message_html("502 fetch failed", "nothing worked", "details here");
        assert!(page.contains("<title>502 fetch failed</title>"));
        assert!(page.contains("<H1>nothing worked</H1>"));
        assert!(page.contains("details here"));
        assert!(!page.contains("{{"));
    }

    #[test]
    fn resume_rewrites_the_range_header() {
        let mut request = get("http://media.example/video.bin");
        rewrite_resume_range(&mut request, 4096, 8191);
        assert_eq!(request.headers[RANGE], "bytes=4096-8191");
    }

    #[tokio::test]
    async fn exhausted_retries_answer_a_gateway_page() {
        // nothing listens on port 1, every attempt fails to connect
        let engine = engine_with(
            RelayOptions {
                identities: vec!["127.0.0.1:1".to_string()],
                framing_quirk: false,
                ..RelayOptions::default()
            },
            AutorangeConfig::default(),
        );
        let mut client = io::Cursor::new(Vec::new());

        engine
            .serve_relay(get("http://origin.test/page"), &mut client)
            .await
            .unwrap();

        let answer = String::from_utf8_lossy(client.get_ref()).to_string();
        assert!(answer.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(answer.contains("Content-Type: text/html"));
        assert!(answer.contains("relay fetch for \"http://origin.test/page\" failed"));
        assert!(engine.stats().count(ErrorKind::Connect) >= FETCH_RETRIES);
    }

    #[tokio::test]
    async fn relay_error_is_forwarded_after_the_last_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            for _ in 0..FETCH_RETRIES {
                let (mut peer, _) = listener.accept().await.unwrap();
                let _ = read_relay_request(&mut peer).await;
                peer.write_all(
                    b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nnot found",
                )
                .await
                .unwrap();
            }
        });

        let engine = engine_with(
            RelayOptions {
                identities: vec![format!("127.0.0.1:{port}")],
                framing_quirk: false,
                ..RelayOptions::default()
            },
            AutorangeConfig::default(),
        );
        let mut client = io::Cursor::new(Vec::new());
        engine
            .serve_relay(get("http://origin.test/missing"), &mut client)
            .await
            .unwrap();
        server.await.unwrap();

        let answer = String::from_utf8_lossy(client.get_ref()).to_string();
        assert!(answer.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(answer.ends_with("not found"));
        assert_eq!(engine.stats().count(ErrorKind::RelayStatus), FETCH_RETRIES);
    }

    async fn read_relay_request(peer: &mut TcpStream) -> Vec<u8> {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if peer.read(&mut byte).await.unwrap() == 0 {
                return head;
            }
            head.push(byte[0]);
        }
        let text = String::from_utf8_lossy(&head).to_string();
        let length = text
            .lines()
            .find_map(|line| line.strip_prefix("Content-Length: "))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        peer.read_exact(&mut body).await.unwrap();
        head.extend_from_slice(&body);
        head
    }
}
