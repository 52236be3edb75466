//! The non-tunneled path: plain origin fetches and CONNECT pumps.
//!
//! Requests that must not ride the relay go straight to the origin over
//! a raced connection. The response head is filtered and relayed back;
//! chunked bodies are de-chunked on the way through since the head the
//! client saw no longer advertises the coding. CONNECT targets get a
//! raw bidirectional pump with an idle timeout.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::Method;
use log::debug;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use url::Url;

use crate::config::{CONNECT_FIRST_READ_BYTES, FORWARD_BUFSIZE, FORWARD_IDLE_TIMEOUT_SECS};
use crate::error_handling::is_client_abort;
use crate::http::{
    content_length, has_chunked_encoding, read_response_head, write_request_head,
    write_response_head, BufferedStream, ClientRequest,
};
use crate::racer::{ConnectionRacer, RaceStream};
use crate::resolver::HostResolver;
use crate::tunnel::framing::QUIRK_PREAMBLE;
use crate::tunnel::metadata::HOP_HEADERS;
use crate::tunnel::{discard_one_response, RelayState, TunnelBody};

pub struct DirectForward {
    resolver: Arc<HostResolver>,
    racer: Arc<ConnectionRacer>,
    state: Arc<RelayState>,
}

/// Which side of a relay copy failed. Client-side failures are usually
/// just the client leaving and get swallowed by the caller.
#[derive(Debug)]
enum CopyError {
    Origin(io::Error),
    Client(io::Error),
}

impl DirectForward {
    pub fn new(
        resolver: Arc<HostResolver>,
        racer: Arc<ConnectionRacer>,
        state: Arc<RelayState>,
    ) -> Self {
        DirectForward {
            resolver,
            racer,
            state,
        }
    }

    /// Fetches `request.url` straight from the origin and relays the
    /// response to `client`.
    ///
    /// `realhost` dials a substitute host while the request itself still
    /// names the original. An origin that answers 400 or 405 to a
    /// quirk-prefixed request disables the quirk for everyone.
    pub async fn serve<W>(
        &self,
        request: &ClientRequest,
        realhost: Option<&str>,
        client: &mut W,
    ) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let parsed =
            Url::parse(&request.url).with_context(|| format!("origin url {:?}", request.url))?;
        let host = parsed
            .host_str()
            .with_context(|| format!("origin url {:?} has no host", request.url))?
            .to_string();
        let port = parsed.port_or_known_default().unwrap_or(80);
        let https = parsed.scheme() == "https";

        let dial_host = realhost.unwrap_or(&host);
        let ips = self
            .resolver
            .resolve(dial_host)
            .await
            .with_context(|| format!("resolving origin {dial_host}"))?;
        let addrs: Vec<SocketAddr> = ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect();

        let raw = if https {
            RaceStream::Tls(Box::new(
                self.racer
                    .connect_tls(&host, &addrs)
                    .await
                    .with_context(|| format!("connecting to origin {host}:{port}"))?,
            ))
        } else {
            RaceStream::Plain(
                self.racer
                    .connect(&addrs)
                    .await
                    .with_context(|| format!("connecting to origin {dial_host}:{port}"))?,
            )
        };
        let mut origin = BufferedStream::new(Bytes::new(), raw);

        // hop-by-hop fields are dropped; unlike the tunnel, Host travels
        let mut outbound = HeaderMap::with_capacity(request.headers.len());
        for (name, value) in &request.headers {
            if HOP_HEADERS.contains(&name.as_str()) {
                continue;
            }
            outbound.append(name, value.clone());
        }
        if !outbound.contains_key(HOST) {
            outbound.insert(
                HOST,
                HeaderValue::try_from(host.as_str()).context("origin host header")?,
            );
        }
        if !request.body.is_empty() && !outbound.contains_key(CONTENT_LENGTH) {
            outbound.insert(CONTENT_LENGTH, HeaderValue::from(request.body.len()));
        }

        let mut target = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            target.push('?');
            target.push_str(query);
        }

        let quirk = !https && self.state.quirk_enabled();
        let mut head = BytesMut::new();
        if quirk {
            head.extend_from_slice(QUIRK_PREAMBLE);
        }
        head.extend_from_slice(&write_request_head(&request.method, &target, &outbound));
        origin
            .write_all(&head)
            .await
            .context("writing origin request")?;
        if !request.body.is_empty() {
            origin
                .write_all(&request.body)
                .await
                .context("writing origin request body")?;
        }
        origin.flush().await.context("writing origin request")?;

        if quirk {
            discard_one_response(&mut origin)
                .await
                .context("origin preamble response")?;
        }

        let (response, leftover) = read_response_head(&mut origin)
            .await
            .context("reading origin response head")?;
        origin.prepend(leftover);
        if quirk && matches!(response.status.as_u16(), 400 | 405) {
            self.state.disable_quirk(response.status.as_u16());
        }

        let mut relayed = response.headers;
        let chunked = has_chunked_encoding(&relayed);
        let limit = content_length(&relayed);
        relayed.remove(TRANSFER_ENCODING);

        if let Err(err) = client
            .write_all(&write_response_head(response.status, &relayed))
            .await
        {
            if is_client_abort(&err) {
                debug!("client left before the {} head: {err}", response.status);
                return Ok(());
            }
            return Err(err).context("writing response head to client");
        }

        // HEAD responses and bodiless statuses end at the head
        if request.method == Method::HEAD || matches!(response.status.as_u16(), 204 | 304) {
            return match client.flush().await {
                Ok(()) => Ok(()),
                Err(err) if is_client_abort(&err) => Ok(()),
                Err(err) => Err(err).context("writing response head to client"),
            };
        }

        let copied = if chunked {
            relay_chunked(origin, client).await
        } else {
            relay_sized(origin, client, limit).await
        };
        match copied {
            Ok(bytes) => {
                debug!("direct fetch of {} relayed {bytes} bytes", request.url);
                Ok(())
            }
            Err(CopyError::Client(err)) if is_client_abort(&err) => {
                debug!("client left mid-body: {err}");
                Ok(())
            }
            Err(CopyError::Client(err)) => Err(err).context("writing response body to client"),
            Err(CopyError::Origin(err)) => Err(err).context("reading origin response body"),
        }
    }

    /// Answers a CONNECT with `200 OK`, reads the client's opening bytes
    /// so they ride along with the dial, then pumps both directions
    /// until either side closes or the link sits idle too long.
    pub async fn connect_pump<C>(
        &self,
        authority: &str,
        mut client: C,
        mask: Option<u8>,
    ) -> anyhow::Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let (host, port) = split_connect_target(authority)?;
        let ips = self
            .resolver
            .resolve(&host)
            .await
            .with_context(|| format!("resolving connect target {host}"))?;
        let addrs: Vec<SocketAddr> = ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect();

        let acked: io::Result<()> = async {
            client.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
            client.flush().await
        }
        .await;
        if let Err(err) = acked {
            if is_client_abort(&err) {
                return Ok(());
            }
            return Err(err).context("acknowledging connect");
        }

        let mut opening = vec![0u8; CONNECT_FIRST_READ_BYTES];
        let n = match client.read(&mut opening).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) if is_client_abort(&err) => return Ok(()),
            Err(err) => return Err(err).context("reading connect opening bytes"),
        };
        opening.truncate(n);

        let mut origin = self
            .racer
            .connect(&addrs)
            .await
            .with_context(|| format!("connecting to {host}:{port}"))?;
        if let Some(key) = mask {
            for byte in &mut opening {
                *byte ^= key;
            }
        }
        origin
            .write_all(&opening)
            .await
            .with_context(|| format!("sending opening bytes to {host}:{port}"))?;

        pump(
            client,
            origin,
            mask,
            Duration::from_secs(FORWARD_IDLE_TIMEOUT_SECS),
        )
        .await
        .context("connect pump")
    }
}

/// Moves bytes both ways until one side closes, an unswallowed error
/// surfaces, or the link sits idle for `idle`. `mask` XORs every byte
/// in both directions.
async fn pump<C, O>(
    mut client: C,
    mut origin: O,
    mask: Option<u8>,
    idle: Duration,
) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; FORWARD_BUFSIZE];
    let mut origin_buf = vec![0u8; FORWARD_BUFSIZE];
    let timer = tokio::time::sleep(idle);
    tokio::pin!(timer);

    let result = loop {
        tokio::select! {
            read = client.read(&mut client_buf) => {
                let n = match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(err) => break swallow_disconnect(err),
                };
                if let Some(key) = mask {
                    for byte in &mut client_buf[..n] {
                        *byte ^= key;
                    }
                }
                if let Err(err) = origin.write_all(&client_buf[..n]).await {
                    break swallow_disconnect(err);
                }
                timer.as_mut().reset(tokio::time::Instant::now() + idle);
            }
            read = origin.read(&mut origin_buf) => {
                let n = match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(err) => break swallow_disconnect(err),
                };
                if let Some(key) = mask {
                    for byte in &mut origin_buf[..n] {
                        *byte ^= key;
                    }
                }
                if let Err(err) = client.write_all(&origin_buf[..n]).await {
                    break swallow_disconnect(err);
                }
                timer.as_mut().reset(tokio::time::Instant::now() + idle);
            }
            _ = &mut timer => {
                debug!("connect pump idle for {idle:?}, closing");
                break Ok(());
            }
        }
    };
    let _ = origin.shutdown().await;
    let _ = client.shutdown().await;
    result
}

/// Disconnect-flavored errors end the pump quietly, like a clean close.
fn swallow_disconnect(err: io::Error) -> io::Result<()> {
    if is_client_abort(&err) || err.kind() == io::ErrorKind::NotConnected {
        debug!("pump ended on {err}");
        Ok(())
    } else {
        Err(err)
    }
}

/// Streams a length-bounded (or read-to-close) body through to the
/// client, returning the byte count.
async fn relay_sized<R, W>(origin: R, client: &mut W, limit: Option<u64>) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut body = TunnelBody::new(origin, limit, None);
    let mut buf = vec![0u8; FORWARD_BUFSIZE];
    let mut total = 0u64;
    loop {
        let n = body.read(&mut buf).await.map_err(CopyError::Origin)?;
        if n == 0 {
            break;
        }
        client
            .write_all(&buf[..n])
            .await
            .map_err(CopyError::Client)?;
        total += n as u64;
    }
    client.flush().await.map_err(CopyError::Client)?;
    Ok(total)
}

/// De-chunks a `Transfer-Encoding: chunked` body while relaying it. The
/// head already went out without the coding, so the client must see the
/// plain byte stream.
async fn relay_chunked<R, W>(origin: R, client: &mut W) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut origin = BufReader::new(origin);
    let mut line = String::new();
    let mut total = 0u64;
    loop {
        line.clear();
        let n = origin.read_line(&mut line).await.map_err(CopyError::Origin)?;
        if n == 0 {
            return Err(CopyError::Origin(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "origin closed during a chunk size line",
            )));
        }
        let token = line.trim().split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(token, 16).map_err(|_| {
            CopyError::Origin(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad chunk size line {token:?}"),
            ))
        })?;
        if size == 0 {
            drain_trailers(&mut origin).await.map_err(CopyError::Origin)?;
            client.flush().await.map_err(CopyError::Client)?;
            return Ok(total);
        }
        let mut chunk = vec![0u8; size];
        origin.read_exact(&mut chunk).await.map_err(CopyError::Origin)?;
        let mut terminator = [0u8; 2];
        origin
            .read_exact(&mut terminator)
            .await
            .map_err(CopyError::Origin)?;
        if &terminator != b"\r\n" {
            return Err(CopyError::Origin(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk missing its terminator",
            )));
        }
        client.write_all(&chunk).await.map_err(CopyError::Client)?;
        total += size as u64;
    }
}

/// Consumes trailer lines after the final chunk, up to the empty line.
async fn drain_trailers<R>(origin: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = origin.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            return Ok(());
        }
    }
}

/// `host:port` from a CONNECT target, defaulting to 443.
fn split_connect_target(authority: &str) -> anyhow::Result<(String, u16)> {
    let parsed = Url::parse(&format!("https://{authority}/"))
        .with_context(|| format!("connect target {authority:?}"))?;
    let host = parsed
        .host_str()
        .with_context(|| format!("connect target {authority:?} has no host"))?
        .to_string();
    Ok((host, parsed.port_or_known_default().unwrap_or(443)))
}
