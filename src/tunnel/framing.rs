//! Tunnel wire framing.
//!
//! Requests carry their compressed metadata either base64-encoded in a
//! cookie or as a 2-byte big-endian length prefix glued ahead of the
//! body. Responses open with a 4-byte lead, the tunneled status and the
//! compressed header block length as two big-endian u16s, followed by
//! the deflated header text. Compression is raw deflate with no stream
//! header or checksum.

use std::io::{Read, Write};

use bytes::{Bytes, BytesMut};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error_handling::{FrameSection, TunnelError};
use crate::http::parse_header_block;

/// Sent ahead of the real request when the framing quirk is active.
/// The relay front answers it with a throwaway response that must be
/// read and discarded before the real exchange.
pub const QUIRK_PREAMBLE: &[u8] = b"GET / HTTP/1.1\r\n\r\n\r\n";

pub fn deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn inflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Concatenates the length-prefixed metadata and the body into the
/// single POST payload used by the non-obfuscated transport.
pub fn length_prefixed(metadata: &[u8], body: &[u8]) -> Result<Bytes, TunnelError> {
    let len = u16::try_from(metadata.len())
        .map_err(|_| TunnelError::OversizedMetadata(metadata.len()))?;
    let mut payload = BytesMut::with_capacity(2 + metadata.len() + body.len());
    payload.extend_from_slice(&len.to_be_bytes());
    payload.extend_from_slice(metadata);
    payload.extend_from_slice(body);
    Ok(payload.freeze())
}

/// Reads the response frame: tunneled status, the number of stream
/// bytes the frame occupied, and the decompressed, parsed header
/// block. Everything after the frame on the stream is body.
pub async fn read_frame<S>(stream: &mut S) -> Result<(u16, u64, HeaderMap), TunnelError>
where
    S: AsyncRead + Unpin,
{
    let mut lead = [0u8; 4];
    read_exact_or_short(stream, &mut lead, FrameSection::Lead).await?;
    let status = u16::from_be_bytes([lead[0], lead[1]]);
    let headers_len = u16::from_be_bytes([lead[2], lead[3]]) as usize;

    let mut block = vec![0u8; headers_len];
    read_exact_or_short(stream, &mut block, FrameSection::HeaderBlock).await?;

    let text = inflate(&block)
        .map_err(|err| TunnelError::MalformedResponse(format!("header block: {err}")))?;
    let headers = parse_header_block(&text)
        .map_err(|err| TunnelError::MalformedResponse(format!("header block: {err}")))?;
    Ok((status, (4 + headers_len) as u64, headers))
}

/// `read_exact` that reports how far it got when the stream ends early.
async fn read_exact_or_short<S>(
    stream: &mut S,
    buf: &mut [u8],
    section: FrameSection,
) -> Result<(), TunnelError>
where
    S: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(TunnelError::ShortFrame {
                section,
                expected: buf.len(),
                received: filled,
            });
        }
        filled += n;
    }
    Ok(())
}
