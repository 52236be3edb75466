//! HTTP/1.x head reading and writing over raw streams.
//!
//! The relay protocol never needs a full HTTP client: requests are
//! written as bytes, response heads are parsed once, and everything
//! after the head is handed off as a byte stream. `BufferedStream`
//! carries the bytes that were read past the head back in front of the
//! socket so downstream readers see one contiguous stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::config::MAX_RESPONSE_HEAD_BYTES;

/// Status line and headers of a parsed response.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// A client request after head parsing, in the shape both proxy paths
/// consume.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A stream with bytes already pulled off the socket sitting in front.
#[derive(Debug)]
pub struct BufferedStream<S> {
    buffer: Bytes,
    inner: S,
}

impl<S> BufferedStream<S> {
    pub fn new(buffer: Bytes, inner: S) -> Self {
        BufferedStream { buffer, inner }
    }

    /// Puts bytes back in front of the stream. Callers only hand back
    /// what they over-read, so the existing buffer is behind `bytes`.
    pub fn prepend(&mut self, bytes: Bytes) {
        if self.buffer.is_empty() {
            self.buffer = bytes;
        } else if !bytes.is_empty() {
            let mut joined = BytesMut::with_capacity(bytes.len() + self.buffer.len());
            joined.extend_from_slice(&bytes);
            joined.extend_from_slice(&self.buffer);
            self.buffer = joined.freeze();
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.buffer.is_empty() {
            let take = self.buffer.len().min(buf.remaining());
            buf.put_slice(&self.buffer.split_to(take));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Reads one response head off `stream`.
///
/// Returns the parsed head and any bytes that arrived past the blank
/// line, which belong to the body.
pub async fn read_response_head<S>(stream: &mut S) -> io::Result<(ResponseHead, Bytes)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let head_len = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos + 4;
        }
        if buf.len() > MAX_RESPONSE_HEAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response head exceeds size cap",
            ));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response head completed",
            ));
        }
    };

    let body_start = buf.split_off(head_len).freeze();
    let head = parse_response_head(&buf)?;
    Ok((head, body_start))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_response_head(head: &[u8]) -> io::Result<ResponseHead> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut header_storage);
    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(invalid_data("incomplete response head"));
        }
        Err(err) => return Err(io::Error::new(io::ErrorKind::InvalidData, err)),
    }
    let status = parsed
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| invalid_data("response status out of range"))?;
    let headers = collect_headers(parsed.headers)?;
    Ok(ResponseHead { status, headers })
}

/// Parses a bare header block, lines of `Name: value` with no leading
/// status line, as carried inside tunnel frames.
pub fn parse_header_block(block: &[u8]) -> io::Result<HeaderMap> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    match httparse::parse_headers(block, &mut header_storage) {
        Ok(httparse::Status::Complete((_, parsed))) => collect_headers(parsed),
        Ok(httparse::Status::Partial) => {
            // a block without the trailing blank line still parses
            let mut terminated = block.to_vec();
            terminated.extend_from_slice(b"\r\n");
            let mut retry_storage = [httparse::EMPTY_HEADER; 64];
            match httparse::parse_headers(&terminated, &mut retry_storage) {
                Ok(httparse::Status::Complete((_, parsed))) => collect_headers(parsed),
                _ => Err(invalid_data("malformed header block")),
            }
        }
        Err(err) => Err(io::Error::new(io::ErrorKind::InvalidData, err)),
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> io::Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Serializes a request head, title-casing the header names that
/// `HeaderMap` stores lowercased.
pub fn write_request_head(method: &Method, target: &str, headers: &HeaderMap) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256);
    buf.extend_from_slice(method.as_str().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(target.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        buf.extend_from_slice(title_case(name.as_str()).as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Serializes a response head for the client, title-casing the names
/// that `HeaderMap` stores lowercased.
pub fn write_response_head(status: StatusCode, headers: &HeaderMap) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256);
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(status.as_str().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    buf.extend_from_slice(b"\r\n");
    for (name, value) in headers {
        buf.extend_from_slice(title_case(name.as_str()).as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf
}

/// `content-type` becomes `Content-Type`.
pub fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut at_start = true;
    for ch in name.chars() {
        if at_start {
            out.extend(ch.to_uppercase());
        } else {
            out.push(ch);
        }
        at_start = ch == '-';
    }
    out
}

pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// True when any `Transfer-Encoding` value lists `chunked`.
pub fn has_chunked_encoding(headers: &HeaderMap) -> bool {
    headers.get_all(TRANSFER_ENCODING).iter().any(|value| {
        value
            .to_str()
            .map(|v| {
                v.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    })
}

fn invalid_data(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn response_head_parses_and_keeps_leftover() {
        let raw =
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhelloEXTRA";
        let mut reader = Cursor::new(&raw[..]);
        let (head, leftover) = read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.headers["content-type"], "text/plain");
        assert_eq!(content_length(&head.headers), Some(5));
        assert_eq!(&leftover[..], b"helloEXTRA");
    }

    #[tokio::test]
    async fn truncated_head_is_an_eof_error() {
        let mut reader = Cursor::new(&b"HTTP/1.1 200 OK\r\nContent-"[..]);
        let err = read_response_head(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn buffered_stream_serves_buffer_before_inner() {
        let inner = Cursor::new(b"world".to_vec());
        let mut stream = BufferedStream::new(Bytes::from_static(b"hello "), inner);
        let mut all = String::new();
        stream.read_to_string(&mut all).await.unwrap();
        assert_eq!(all, "hello world");
    }

    #[test]
    fn header_block_parses_with_or_without_trailing_blank() {
        let block = b"Content-Type: image/png\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n";
        let headers = parse_header_block(block).unwrap();
        assert_eq!(headers["content-type"], "image/png");
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);

        let bare = b"Content-Type: image/png\r\n";
        let headers = parse_header_block(bare).unwrap();
        assert_eq!(headers["content-type"], "image/png");
    }

    #[test]
    fn request_head_is_well_formed() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("relay.example"));
        headers.insert("content-length", HeaderValue::from_static("4"));
        let head = write_request_head(&Method::POST, "/fetch", &headers);
        let text = std::str::from_utf8(&head).unwrap();
        assert!(text.starts_with("POST /fetch HTTP/1.1\r\n"));
        assert!(text.contains("Host: relay.example\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn title_case_handles_multi_part_names() {
        assert_eq!(title_case("content-type"), "Content-Type");
        assert_eq!(title_case("x-status"), "X-Status");
        assert_eq!(title_case("etag"), "Etag");
    }

    #[test]
    fn chunked_encoding_is_detected_in_token_lists() {
        let mut headers = HeaderMap::new();
        assert!(!has_chunked_encoding(&headers));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("gzip, Chunked"));
        assert!(has_chunked_encoding(&headers));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("identity"));
        assert!(!has_chunked_encoding(&headers));
    }
}
