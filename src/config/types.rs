//! Typed configuration structs.
//!
//! The host process builds a [`ProxyConfig`] (however it likes; there is no
//! file format here) and hands it to the component constructors. Defaults
//! come from [`super::constants`].

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use super::constants;

/// How the proxy reaches relay endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayScheme {
    Http,
    Https,
}

impl RelayScheme {
    pub fn default_port(self) -> u16 {
        match self {
            RelayScheme::Http => 80,
            RelayScheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelayScheme::Http => "http",
            RelayScheme::Https => "https",
        }
    }
}

/// Host resolution settings.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Trusted remote DNS servers queried raw when local resolution fails
    /// or returns nothing usable.
    pub remote_servers: Vec<SocketAddr>,
    /// Answers matching this set are dropped (local) or poison the whole
    /// reply (remote).
    pub poisoned_ips: HashSet<IpAddr>,
    /// Attempts per remote server; the last one runs over TCP.
    pub attempts: usize,
    /// Wait per UDP receive.
    pub udp_wait: Duration,
    /// Datagrams examined per UDP attempt.
    pub udp_reads: usize,
    /// Timeout for local (system) lookups.
    pub local_timeout: Duration,
    /// Set when the host has no usable system resolver; skips straight to
    /// the remote servers.
    pub skip_local: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            remote_servers: vec![SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 53))],
            poisoned_ips: constants::POISONED_IPS
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            attempts: constants::DNS_ATTEMPTS,
            udp_wait: Duration::from_secs(constants::DNS_UDP_WAIT_SECS),
            udp_reads: constants::DNS_UDP_READS,
            local_timeout: Duration::from_secs(constants::DNS_LOCAL_TIMEOUT_SECS),
            skip_local: false,
        }
    }
}

/// Substitute server-name used during TLS handshakes with hosts under
/// `suffix`; the certificate subject must then match either name.
#[derive(Debug, Clone)]
pub struct SniOverride {
    pub suffix: String,
    pub server_name: String,
}

/// Connection racing settings.
#[derive(Debug, Clone)]
pub struct RacerConfig {
    /// Base window `W` in the round-`i` window `ceil((W+1)/2) + i`.
    pub max_window: usize,
    /// Rounds before the race gives up.
    pub max_retries: usize,
    /// Per-attempt dial timeout.
    pub connect_timeout: Duration,
    /// Synthetic latency written for failed attempts.
    pub timeout_ceiling: Duration,
    /// Jitter span added to the ceiling.
    pub failure_jitter: Duration,
    /// TLS handshake stage cap.
    pub handshake_timeout: Duration,
    /// Requested receive buffer size.
    pub recv_buffer: u32,
    /// Verify relay/origin certificates. The subject check for SNI
    /// overrides only runs when this is on.
    pub validate: bool,
    /// Hosting domains reached with a substitute SNI.
    pub sni_overrides: Vec<SniOverride>,
}

impl Default for RacerConfig {
    fn default() -> Self {
        Self {
            max_window: constants::RACE_MAX_WINDOW,
            max_retries: constants::RACE_MAX_RETRIES,
            connect_timeout: Duration::from_secs(constants::RACE_CONNECT_TIMEOUT_SECS),
            timeout_ceiling: Duration::from_secs(constants::RACE_TIMEOUT_CEILING_SECS),
            failure_jitter: Duration::from_millis(constants::FAILURE_JITTER_MAX_MILLIS),
            handshake_timeout: Duration::from_secs(constants::TLS_HANDSHAKE_TIMEOUT_SECS),
            recv_buffer: constants::SOCKET_RECV_BUFFER_BYTES,
            validate: false,
            sni_overrides: Vec::new(),
        }
    }
}

/// Relay endpoint set and tunnel behavior toggles.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Relay hostnames, rotated round-robin on quota errors. May carry an
    /// explicit `host:port`.
    pub identities: Vec<String>,
    /// Path on the relay that accepts tunnel requests.
    pub path: String,
    /// Initial transport scheme; downgrade handling may force `Https`.
    pub scheme: RelayScheme,
    /// Carry metadata in a base64 cookie instead of the length-prefixed
    /// binary payload.
    pub obfuscate: bool,
    /// Shared secret forwarded as the `G-password` option.
    pub password: Option<String>,
    /// Ask the relay to validate upstream certificates (`G-validate`).
    pub validate: bool,
    /// Apply a single-byte XOR keystream to response bodies on plain-scheme
    /// transports, key drawn from `password`.
    pub xor_obfuscation: bool,
    /// Send the decoy preamble on plain-scheme relay connections until the
    /// relay objects.
    pub framing_quirk: bool,
    /// Treat relay 502 as a gateway signal that forces the TLS-only scheme,
    /// as 400/504 always do.
    pub scheme_switch_on_502: bool,
    /// How long range workers skip an identity after a server error.
    pub cooldown: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            identities: Vec::new(),
            path: "/fetch".to_string(),
            scheme: RelayScheme::Http,
            obfuscate: false,
            password: None,
            validate: false,
            xor_obfuscation: false,
            framing_quirk: true,
            scheme_switch_on_502: false,
            cooldown: Duration::from_secs(constants::RELAY_COOLDOWN_SECS),
        }
    }
}

/// Range reassembly settings.
#[derive(Debug, Clone)]
pub struct RangeConfig {
    /// Bytes per range job.
    pub maxsize: u64,
    /// Read size when streaming job bodies.
    pub bufsize: usize,
    /// Concurrent workers.
    pub workers: usize,
    /// No-progress bound on the delivery wait.
    pub stall_timeout: Duration,
    /// Buffered-but-undelivered byte ceiling.
    pub buffer_ceiling: usize,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            maxsize: constants::RANGE_MAXSIZE_BYTES,
            bufsize: constants::RANGE_BUFSIZE_BYTES,
            workers: constants::RANGE_WORKERS,
            stall_timeout: Duration::from_secs(constants::RANGE_STALL_TIMEOUT_SECS),
            buffer_ceiling: constants::RANGE_BUFFER_CEILING_BYTES,
        }
    }
}

/// When to split a plain GET into range jobs.
#[derive(Debug, Clone)]
pub struct AutorangeConfig {
    /// Host suffixes always range-fetched (e.g. large-file CDNs).
    pub hosts: Vec<String>,
    /// Path suffixes that trigger range fetching.
    pub suffixes: Vec<String>,
    /// Path suffixes that never do, overriding a host match.
    pub exclude_suffixes: Vec<String>,
}

impl Default for AutorangeConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            suffixes: constants::AUTORANGE_SUFFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            exclude_suffixes: constants::AUTORANGE_EXCLUDE_SUFFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Everything the engine needs, grouped.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub resolver: ResolverConfig,
    pub racer: RacerConfig,
    pub relay: RelayOptions,
    pub range: RangeConfig,
    pub autorange: AutorangeConfig,
}
