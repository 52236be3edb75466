// Shared test helpers: a scripted relay speaking the tunnel wire
// protocol over a local listener, plus the builders the test files
// drive it with.

use std::io::{Read as _, Write as _};
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use http::{HeaderMap, Method};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use tunnel_proxy::config::{ProxyConfig, RacerConfig, RelayOptions, ResolverConfig};
use tunnel_proxy::racer::ConnectionRacer;
use tunnel_proxy::resolver::HostResolver;
use tunnel_proxy::tunnel::{RelayState, RelayTunnel};
use tunnel_proxy::{ClientRequest, ProxyEngine};

/// Deterministic body bytes for reassembly checks.
#[allow(dead_code)] // Used by other test files
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[allow(dead_code)]
pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

#[allow(dead_code)]
pub fn inflate(data: &[u8]) -> Vec<u8> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).unwrap();
    out
}

/// One complete relay answer: outer 200 head, then the 4-byte frame
/// lead, the deflated header block, and the raw body.
#[allow(dead_code)]
pub fn framed_response(status: u16, header_text: &str, body: &[u8]) -> Vec<u8> {
    let block = deflate(header_text.as_bytes());
    let mut frame = Vec::with_capacity(4 + block.len() + body.len());
    frame.extend_from_slice(&status.to_be_bytes());
    frame.extend_from_slice(&(block.len() as u16).to_be_bytes());
    frame.extend_from_slice(&block);
    frame.extend_from_slice(body);
    let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", frame.len());
    let mut out = head.into_bytes();
    out.extend_from_slice(&frame);
    out
}

/// Reads one full request, head plus any Content-Length body, off a peer.
#[allow(dead_code)]
pub async fn read_request(peer: &mut TcpStream) -> Vec<u8> {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        if peer.read(&mut byte).await.unwrap() == 0 {
            return raw;
        }
        raw.push(byte[0]);
    }
    let text = String::from_utf8_lossy(&raw).to_string();
    let length = text
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    peer.read_exact(&mut body).await.unwrap();
    raw.extend_from_slice(&body);
    raw
}

/// The inflated metadata block of a plain-transport request, whose body
/// is the 2-byte length prefix, the deflated block, then the payload.
#[allow(dead_code)]
pub fn request_metadata(request: &[u8]) -> String {
    let head_end = request
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("request head terminator")
        + 4;
    let body = &request[head_end..];
    let len = u16::from_be_bytes([body[0], body[1]]) as usize;
    String::from_utf8(inflate(&body[2..2 + len])).expect("metadata is text")
}

/// The `Range` header a tunneled request carried, as (start, end).
#[allow(dead_code)]
pub fn metadata_range(metadata: &str) -> Option<(u64, u64)> {
    let line = metadata.lines().find_map(|l| l.strip_prefix("Range:"))?;
    let spec = line.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

#[allow(dead_code)]
pub fn relay_options(port: u16, quirk: bool) -> RelayOptions {
    RelayOptions {
        identities: vec![format!("127.0.0.1:{port}")],
        framing_quirk: quirk,
        ..RelayOptions::default()
    }
}

#[allow(dead_code)]
pub fn tunnel_for(options: RelayOptions) -> RelayTunnel {
    let resolver = Arc::new(HostResolver::new(ResolverConfig::default()));
    let racer = Arc::new(ConnectionRacer::new(RacerConfig::default()));
    let state = Arc::new(RelayState::new(options).expect("relay options"));
    RelayTunnel::new(resolver, racer, state)
}

#[allow(dead_code)]
pub fn engine_for(options: RelayOptions) -> ProxyEngine {
    ProxyEngine::new(ProxyConfig {
        relay: options,
        ..ProxyConfig::default()
    })
    .expect("engine config")
}

#[allow(dead_code)]
pub fn get_request(url: &str) -> ClientRequest {
    ClientRequest {
        method: Method::GET,
        url: url.to_string(),
        headers: HeaderMap::new(),
        body: Bytes::new(),
    }
}
