//! Poison-aware hostname resolution.
//!
//! Resolution order: IP literals pass straight through, then the pinned
//! cache, then the system resolver, then trusted remote servers queried
//! with raw packets. Replies carrying a known-poisoned address are
//! discarded wholesale on the remote path and filtered entry-by-entry on
//! the local path, since a local answer may legitimately mix good and
//! bad records while a forged remote reply is untrustworthy end to end.

pub mod query;

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use hickory_resolver::TokioAsyncResolver;
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::config::ResolverConfig;
use crate::error_handling::ResolveError;

/// Resolves hostnames with a pinned-entry cache in front.
///
/// The cache doubles as a pinning mechanism: callers that already know
/// the good addresses for a host (relay frontends, CONNECT targets that
/// resolved once) insert them and every later lookup short-circuits.
pub struct HostResolver {
    local: Option<TokioAsyncResolver>,
    cache: RwLock<HashMap<String, Vec<IpAddr>>>,
    cfg: ResolverConfig,
}

impl HostResolver {
    pub fn new(cfg: ResolverConfig) -> Self {
        let local = if cfg.skip_local {
            None
        } else {
            Some(system_resolver(&cfg))
        };
        HostResolver {
            local,
            cache: RwLock::new(HashMap::new()),
            cfg,
        }
    }

    /// Resolves `host` to its usable addresses.
    ///
    /// Results are cached, so a host resolves over the network at most
    /// once until [`pin`](Self::pin) replaces its entry.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        if let Some(cached) = self.cache.read().await.get(host) {
            return Ok(cached.clone());
        }

        let mut ips = Vec::new();
        if !self.cfg.skip_local {
            if let Some(local) = self.resolve_local(host).await {
                ips = local;
            }
        }
        if ips.is_empty() {
            if self.cfg.remote_servers.is_empty() {
                return Err(ResolveError::NoAddress {
                    host: host.to_string(),
                });
            }
            ips = self.resolve_remote(host).await?;
        }

        let ips = dedup(ips);
        self.cache.write().await.insert(host.to_string(), ips.clone());
        Ok(ips)
    }

    /// Pins `host` to a fixed address list, replacing any cached entry.
    pub async fn pin(&self, host: impl Into<String>, ips: Vec<IpAddr>) {
        self.cache.write().await.insert(host.into(), ips);
    }

    /// System-resolver lookup with per-entry poison filtering.
    ///
    /// Returns `None` when the lookup failed, timed out, or every answer
    /// was poisoned, so the caller falls through to the remote path.
    async fn resolve_local(&self, host: &str) -> Option<Vec<IpAddr>> {
        let resolver = self.local.as_ref()?;
        match timeout(self.cfg.local_timeout, resolver.lookup_ip(host)).await {
            Ok(Ok(lookup)) => {
                let (clean, poisoned): (Vec<IpAddr>, Vec<IpAddr>) = lookup
                    .iter()
                    .partition(|ip| !self.cfg.poisoned_ips.contains(ip));
                if !poisoned.is_empty() {
                    warn!("dropped {} poisoned local answers for {host}", poisoned.len());
                }
                if clean.is_empty() {
                    None
                } else {
                    Some(clean)
                }
            }
            Ok(Err(err)) => {
                debug!("local dns lookup for {host} failed: {err}");
                None
            }
            Err(_) => {
                debug!("local dns lookup for {host} timed out");
                None
            }
        }
    }

    /// Queries the trusted remote servers with raw packets.
    ///
    /// UDP for the early attempts so forged replies can be discarded and
    /// the genuine one still caught; TCP on the final attempt, which an
    /// off-path forger cannot complete.
    async fn resolve_remote(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let attempts = self.cfg.attempts.max(1);
        for attempt in 1..=attempts {
            let final_attempt = attempt == attempts;
            for server in &self.cfg.remote_servers {
                let outcome = if final_attempt {
                    self.query_tcp(host, *server).await
                } else {
                    self.query_udp(host, *server).await
                };
                match outcome {
                    Ok(Some(ips)) => return Ok(ips),
                    Ok(None) => {}
                    Err(err) => {
                        debug!("remote dns query to {server} for {host} failed: {err}");
                    }
                }
            }
        }
        Err(ResolveError::RemoteExhausted {
            host: host.to_string(),
            attempts,
        })
    }

    /// One UDP exchange. Reads several replies per question because a
    /// forged answer typically races ahead of the real one; `Ok(None)`
    /// means the read budget ran out without a trustworthy reply.
    async fn query_udp(&self, host: &str, server: SocketAddr) -> io::Result<Option<Vec<IpAddr>>> {
        let (id, packet) = query::build_query(host).map_err(invalid_host)?;
        let socket = UdpSocket::bind(unspecified_for(server)).await?;
        socket.send_to(&packet, server).await?;

        let mut buf = [0u8; 512];
        for _ in 0..self.cfg.udp_reads {
            let received = match timeout(self.cfg.udp_wait, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(err)) => return Err(err),
                Err(_) => return Ok(None),
            };
            if let Some(ips) = self.vet_reply(host, server, &buf[..received], id) {
                return Ok(Some(ips));
            }
        }
        Ok(None)
    }

    /// One TCP exchange, length-prefixed both ways.
    async fn query_tcp(&self, host: &str, server: SocketAddr) -> io::Result<Option<Vec<IpAddr>>> {
        let (id, packet) = query::build_query(host).map_err(invalid_host)?;
        let exchange = async {
            let mut stream = TcpStream::connect(server).await?;
            stream.write_all(&query::frame_tcp(&packet)).await?;
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let mut reply = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut reply).await?;
            io::Result::Ok(reply)
        };
        let reply = match timeout(self.cfg.udp_wait * 2, exchange).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => return Err(err),
            Err(_) => return Ok(None),
        };
        Ok(self.vet_reply(host, server, &reply, id))
    }

    /// Parses a remote reply and rejects it outright if malformed, empty,
    /// or touched by any poisoned address.
    fn vet_reply(
        &self,
        host: &str,
        server: SocketAddr,
        reply: &[u8],
        expect_id: u16,
    ) -> Option<Vec<IpAddr>> {
        let ips = match query::parse_answers(reply, expect_id) {
            Ok(ips) => ips,
            Err(reason) => {
                debug!("ignoring malformed dns reply for {host} from {server}: {reason}");
                return None;
            }
        };
        if ips.is_empty() {
            return None;
        }
        if ips
            .iter()
            .any(|ip| self.cfg.poisoned_ips.contains(&IpAddr::V4(*ip)))
        {
            warn!("discarding poisoned dns reply for {host} from {server}");
            return None;
        }
        Some(ips.into_iter().map(IpAddr::V4).collect())
    }
}

fn system_resolver(cfg: &ResolverConfig) -> TokioAsyncResolver {
    use hickory_resolver::config::{ResolverConfig, ResolverOpts};

    let mut opts = ResolverOpts::default();
    opts.timeout = cfg.local_timeout;
    opts.attempts = 2;
    opts.ndots = 0;
    TokioAsyncResolver::tokio(ResolverConfig::default(), opts)
}

fn unspecified_for(server: SocketAddr) -> SocketAddr {
    if server.is_ipv6() {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }
}

fn invalid_host(reason: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, reason)
}

fn dedup(ips: Vec<IpAddr>) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    ips.into_iter().filter(|ip| seen.insert(*ip)).collect()
}
