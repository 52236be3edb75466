//! Typed errors for each failure domain.
//!
//! One enum per layer: resolution, racing, tunnel framing, range
//! reassembly. Orchestration code wraps these in `anyhow` with context;
//! nothing below the `proxy` module does.

use std::io;
use std::time::Duration;

use strum_macros::EnumIter;
use thiserror::Error;

/// Host resolution failures.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Every source (cache, local, remote) came back empty after
    /// poisoned-answer filtering.
    #[error("no usable address for {host}")]
    NoAddress { host: String },

    /// Every attempt against every configured remote server failed or
    /// returned poisoned data.
    #[error("remote DNS query for {host} exhausted {attempts} attempts")]
    RemoteExhausted { host: String, attempts: usize },

    /// A reply was received but could not be parsed as a DNS message.
    #[error("malformed DNS reply: {0}")]
    MalformedReply(&'static str),

    #[error("DNS transport error: {0}")]
    Io(#[from] io::Error),
}

/// Connection racing failures.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no candidate addresses to dial")]
    NoCandidates,

    /// Every candidate failed in every round. Carries the first socket
    /// error observed, which is usually the most honest one.
    #[error("all {candidates} candidates failed across {rounds} rounds")]
    Exhausted {
        candidates: usize,
        rounds: usize,
        #[source]
        first: io::Error,
    },
}

/// Which part of the response frame came up short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSection {
    /// The 4-byte status/header-length lead.
    Lead,
    /// The deflate-compressed header block.
    HeaderBlock,
}

impl std::fmt::Display for FrameSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameSection::Lead => write!(f, "frame lead"),
            FrameSection::HeaderBlock => write!(f, "header block"),
        }
    }
}

/// Tunnel codec failures.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// The relay closed or truncated the stream before delivering the
    /// bytes its own framing declared. Surfaced as-is, never retried here.
    #[error("short {section}: expected {expected} bytes, got {received}")]
    ShortFrame {
        section: FrameSection,
        expected: usize,
        received: usize,
    },

    /// The relay answered with something that is not the tunnel protocol.
    #[error("malformed relay response: {0}")]
    MalformedResponse(String),

    /// The metadata block cannot fit the 16-bit length prefix.
    #[error("metadata block too large for framing: {0} bytes")]
    OversizedMetadata(usize),

    #[error("relay I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Range reassembly failures. Per-job problems are handled by re-enqueueing
/// and never appear here; these abort the whole transfer.
#[derive(Debug, Error)]
pub enum RangeError {
    /// Nothing arrived at the expected offset within the bound.
    #[error("range delivery stalled at offset {offset} after {waited:?}")]
    Stalled { offset: u64, waited: Duration },

    /// A worker produced a chunk below the delivery cursor; the byte
    /// stream can no longer be trusted.
    #[error("chunk offset {start} below expected offset {expected}")]
    StaleOffset { start: u64, expected: u64 },

    #[error("client write failed: {0}")]
    ClientWrite(#[source] io::Error),

    /// The transfer was cancelled by a previous failure.
    #[error("transfer aborted")]
    Aborted,
}

/// Failure families tracked by [`super::stats::TunnelStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum ErrorKind {
    Resolution,
    Connect,
    TunnelFrame,
    RelayStatus,
    RangeAbort,
    ClientAbort,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Resolution => "resolution",
            ErrorKind::Connect => "connect",
            ErrorKind::TunnelFrame => "tunnel_frame",
            ErrorKind::RelayStatus => "relay_status",
            ErrorKind::RangeAbort => "range_abort",
            ErrorKind::ClientAbort => "client_abort",
        }
    }
}
