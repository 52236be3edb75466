//! Tunneled response body reader.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

/// Streams the body that follows a response frame.
///
/// Honors the declared content length when one was given, ending the
/// stream there instead of waiting on a relay that keeps the socket
/// open, and reports a truncated body as an error rather than a clean
/// end. When a keystream byte was agreed with the relay the payload is
/// decoded as it passes through.
#[derive(Debug)]
pub struct TunnelBody<S> {
    inner: S,
    remaining: Option<u64>,
    xor_key: Option<u8>,
}

impl<S> TunnelBody<S> {
    pub fn new(inner: S, remaining: Option<u64>, xor_key: Option<u8>) -> Self {
        TunnelBody {
            inner,
            remaining,
            xor_key,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TunnelBody<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.remaining == Some(0) || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let unfilled = buf.initialize_unfilled();
        let cap = match this.remaining {
            Some(left) => unfilled.len().min(left as usize),
            None => unfilled.len(),
        };
        let mut limited = ReadBuf::new(&mut unfilled[..cap]);
        match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
            Poll::Ready(Ok(())) => {}
        }

        let n = limited.filled().len();
        if n == 0 {
            if this.remaining.is_some() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "body ended before the declared length",
                )));
            }
            return Poll::Ready(Ok(()));
        }
        if let Some(key) = this.xor_key {
            for byte in limited.filled_mut() {
                *byte ^= key;
            }
        }
        buf.advance(n);
        if let Some(left) = this.remaining.as_mut() {
            *left -= n as u64;
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn stops_at_declared_length() {
        let inner = Cursor::new(b"0123456789TRAILING".to_vec());
        let mut body = TunnelBody::new(inner, Some(10), None);
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"0123456789");
    }

    #[tokio::test]
    async fn reads_to_eof_without_length() {
        let inner = Cursor::new(b"whole stream".to_vec());
        let mut body = TunnelBody::new(inner, None, None);
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"whole stream");
    }

    #[tokio::test]
    async fn early_eof_with_declared_length_is_an_error() {
        let inner = Cursor::new(b"short".to_vec());
        let mut body = TunnelBody::new(inner, Some(100), None);
        let mut out = Vec::new();
        let err = body.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn keystream_byte_decodes_payload() {
        let encoded: Vec<u8> = b"secret".iter().map(|b| b ^ 0x5A).collect();
        let mut body = TunnelBody::new(Cursor::new(encoded), Some(6), Some(0x5A));
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"secret");
    }
}
