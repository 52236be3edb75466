//! Socket dialing with tuning, and the unified relay stream type.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;

/// Connects to `addr` with the socket options every raced connection
/// gets: address reuse, a bounded receive buffer, and Nagle disabled.
pub async fn dial(addr: SocketAddr, recv_buffer: u32) -> io::Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.set_recv_buffer_size(recv_buffer)?;
    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// A raced connection, plain or TLS, behind one read/write surface.
#[derive(Debug)]
pub enum RaceStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl RaceStream {
    /// Leaf certificate presented by the peer, when this is a TLS
    /// stream and the peer sent one.
    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        match self {
            RaceStream::Plain(_) => None,
            RaceStream::Tls(stream) => stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.as_ref().to_vec()),
        }
    }
}

impl AsyncRead for RaceStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            RaceStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            RaceStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RaceStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            RaceStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            RaceStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            RaceStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            RaceStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            RaceStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            RaceStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
