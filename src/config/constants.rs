//! Default tuning values.
//!
//! Everything here is a default for a field in [`crate::config::types`];
//! nothing reads these directly at runtime. The network-shaped values
//! (windows, ceilings, deny-list) are era-specific heuristics and are
//! expected to be overridden by the host process.

/// Remote DNS query attempts before giving up on one server.
/// The final attempt switches from UDP to TCP.
pub const DNS_ATTEMPTS: usize = 3;

/// Per-receive wait on a raw UDP DNS query (seconds).
pub const DNS_UDP_WAIT_SECS: u64 = 2;

/// Datagrams read per UDP attempt before retrying. Forged answers often
/// arrive ahead of the genuine one, so one attempt keeps listening after
/// discarding a poisoned reply.
pub const DNS_UDP_READS: usize = 3;

/// Timeout for hickory lookups against the system resolver (seconds).
pub const DNS_LOCAL_TIMEOUT_SECS: u64 = 3;

/// Base race window: round `i` dials `ceil((W+1)/2) + i` of the
/// fastest-known addresses plus an equal-size exploration sample.
pub const RACE_MAX_WINDOW: usize = 4;

/// Race rounds before the aggregated connect error is surfaced.
pub const RACE_MAX_RETRIES: usize = 4;

/// Per-attempt connect cap (seconds). Also the synthetic latency ceiling
/// written for failed attempts.
pub const RACE_TIMEOUT_CEILING_SECS: u64 = 16;

/// Per-attempt dial timeout (seconds) when the caller passes none.
pub const RACE_CONNECT_TIMEOUT_SECS: u64 = 4;

/// TLS handshake stage cap (seconds), on top of the established TCP stream.
pub const TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Jitter span added to the failure latency ceiling (milliseconds), so
/// failed addresses do not all collapse onto one sort key.
pub const FAILURE_JITTER_MAX_MILLIS: u64 = 1000;

/// Receive buffer requested on raced sockets (bytes). 8K stalls large
/// browser-driven downloads; 32K keeps the pipe fed.
pub const SOCKET_RECV_BUFFER_BYTES: u32 = 32 * 1024;

/// Bodies at or above this size are sent uncompressed; deflating them
/// buys little and stalls the first write (bytes).
pub const MAX_DEFLATE_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Cap on a decoded response head, preamble responses included (bytes).
pub const MAX_RESPONSE_HEAD_BYTES: usize = 64 * 1024;

/// Local retry bound for one proxied request before the client sees a 502.
pub const FETCH_RETRIES: usize = 3;

/// Per-read bound while streaming a tunneled body (seconds). A lapse
/// with a known content range turns into a resumed fetch at the
/// current offset instead of a dead connection.
pub const RELAY_BODY_READ_TIMEOUT_SECS: u64 = 16;

/// Range sub-fetch size (bytes): one job covers at most this many.
pub const RANGE_MAXSIZE_BYTES: u64 = 4 * 1024 * 1024;

/// Read size for streaming job bodies into chunks (bytes).
pub const RANGE_BUFSIZE_BYTES: usize = 8192;

/// Concurrent range workers.
pub const RANGE_WORKERS: usize = 2;

/// No-progress wait for the next expected chunk before the whole
/// transfer aborts (seconds).
pub const RANGE_STALL_TIMEOUT_SECS: u64 = 90;

/// Ceiling on buffered-but-undelivered chunk bytes before workers pause.
pub const RANGE_BUFFER_CEILING_BYTES: usize = 64 * 1024 * 1024;

/// How long a relay identity is skipped by range workers after it
/// returned a server error (seconds).
pub const RELAY_COOLDOWN_SECS: u64 = 5;

/// A CONNECT pump closes after this long with no traffic in either
/// direction (seconds). Any byte resets the clock.
pub const FORWARD_IDLE_TIMEOUT_SECS: u64 = 60;

/// Copy size for the direct-forward paths (bytes).
pub const FORWARD_BUFSIZE: usize = 8192;

/// Bytes read from the client right after the CONNECT 200 so the first
/// payload (usually a TLS hello) rides along with the dial.
pub const CONNECT_FIRST_READ_BYTES: usize = 1024;

/// Addresses known to be returned by poisoned DNS answers rather than by
/// the queried host. Representative defaults; the full list is deployment
/// configuration.
pub const POISONED_IPS: &[&str] = &[
    "1.1.1.1",
    "255.255.255.255",
    "4.36.66.178",
    "8.7.198.45",
    "37.61.54.158",
    "46.82.174.68",
    "59.24.3.173",
    "64.33.88.161",
    "78.16.49.15",
    "93.46.8.89",
    "128.121.126.139",
    "159.106.121.75",
    "169.132.13.103",
    "202.106.1.2",
    "203.98.7.65",
    "216.234.179.13",
    "243.185.187.39",
];

/// Path suffixes that trigger range-split downloads when the client did
/// not ask for a range itself.
pub const AUTORANGE_SUFFIXES: &[&str] = &[
    ".zip", ".rar", ".7z", ".tar", ".gz", ".bz2", ".xz", ".iso", ".exe", ".msi", ".dmg", ".mp3",
    ".mp4", ".avi", ".mkv", ".flv", ".ogg", ".pdf",
];

/// Path suffixes excluded from autorange even when a host pattern matches;
/// these are typically streamed progressively by players.
pub const AUTORANGE_EXCLUDE_SUFFIXES: &[&str] =
    &[".xml", ".json", ".html", ".js", ".css", ".jpg", ".png"];
