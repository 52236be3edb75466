//! Latency-ordered connection racing.
//!
//! Every resolved address for a host competes: each round dials the
//! fastest known addresses plus an equal-sized random sample, and the
//! first connection to come up wins. Losing attempts keep running long
//! enough to record their latency, so the ordering improves with use.
//! The window widens a little every round so a bad first guess cannot
//! starve the rest of the pool.

mod latency;
mod stream;
mod tls;

pub use stream::RaceStream;

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use rand::seq::IndexedRandom;
use rand::Rng;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::RacerConfig;
use crate::error_handling::ConnectError;
use latency::LatencyTable;

pub struct ConnectionRacer {
    cfg: RacerConfig,
    latency: Arc<LatencyTable>,
    verified: TlsConnector,
    lenient: TlsConnector,
}

/// Shared pieces of one TLS attempt, cloned into each racing task.
#[derive(Clone)]
struct TlsAttempt {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    accepted: Arc<Vec<String>>,
    check_subject: bool,
}

#[derive(Clone, Copy)]
struct DialTiming {
    connect_timeout: Duration,
    handshake_timeout: Duration,
    recv_buffer: u32,
    penalty_ceiling: Duration,
    penalty_jitter: Duration,
}

impl ConnectionRacer {
    pub fn new(cfg: RacerConfig) -> Self {
        ConnectionRacer {
            latency: Arc::new(LatencyTable::default()),
            verified: tls::verified_connector(),
            lenient: tls::lenient_connector(),
            cfg,
        }
    }

    /// Races a plain TCP connection to `addrs`, first success wins.
    pub async fn connect(&self, addrs: &[SocketAddr]) -> Result<TcpStream, ConnectError> {
        if addrs.is_empty() {
            return Err(ConnectError::NoCandidates);
        }
        let timing = self.timing();
        let mut first_error: Option<io::Error> = None;

        for round in 0..self.cfg.max_retries {
            let picks = self.candidates(addrs, round, false).await;
            let (tx, mut rx) = mpsc::channel(picks.len());
            for addr in picks {
                let tx = tx.clone();
                let latency = Arc::clone(&self.latency);
                tokio::spawn(async move {
                    let result = race_once(addr, timing, &latency).await;
                    let _ = tx.send((addr, result)).await;
                });
            }
            drop(tx);

            while let Some((addr, result)) = rx.recv().await {
                match result {
                    Ok(conn) => return Ok(conn),
                    Err(err) => {
                        if first_error.is_none() {
                            warn!("connect to {addr} failed: {err}");
                            first_error = Some(err);
                        }
                    }
                }
            }
        }

        Err(self.exhausted(addrs.len(), first_error))
    }

    /// Races a TLS connection to `addrs` for `host`, applying any SNI
    /// substitution and, when validating under a substitute, checking
    /// the leaf certificate covers an expected name.
    pub async fn connect_tls(
        &self,
        host: &str,
        addrs: &[SocketAddr],
    ) -> Result<TlsStream<TcpStream>, ConnectError> {
        if addrs.is_empty() {
            return Err(ConnectError::NoCandidates);
        }
        let sni = tls::sni_for(host, &self.cfg.sni_overrides);
        let substituted = sni != host;
        let server_name = match tls::server_name(sni) {
            Ok(name) => name,
            Err(err) => return Err(self.exhausted(addrs.len(), Some(err))),
        };
        let attempt = TlsAttempt {
            connector: if self.cfg.validate {
                self.verified.clone()
            } else {
                self.lenient.clone()
            },
            server_name,
            accepted: Arc::new(vec![sni.to_string(), host.to_string()]),
            check_subject: self.cfg.validate && substituted,
        };
        let timing = self.timing();
        let mut first_error: Option<io::Error> = None;

        for round in 0..self.cfg.max_retries {
            let picks = self.candidates(addrs, round, true).await;
            let (tx, mut rx) = mpsc::channel(picks.len());
            for addr in picks {
                let tx = tx.clone();
                let latency = Arc::clone(&self.latency);
                let attempt = attempt.clone();
                tokio::spawn(async move {
                    let result = race_tls_once(addr, attempt, timing, &latency).await;
                    let _ = tx.send((addr, result)).await;
                });
            }
            drop(tx);

            while let Some((addr, result)) = rx.recv().await {
                match result {
                    Ok(stream) => return Ok(stream),
                    Err(err) => {
                        if first_error.is_none() {
                            warn!("tls connect to {addr} for {host} failed: {err}");
                            first_error = Some(err);
                        }
                    }
                }
            }
        }

        Err(self.exhausted(addrs.len(), first_error))
    }

    /// Candidate list for one round: the `window` fastest addresses plus
    /// an equal-sized random sample, deduplicated in pick order. The
    /// window starts at half the configured maximum and grows by one
    /// per round, capped at the pool size.
    async fn candidates(&self, addrs: &[SocketAddr], round: usize, tls: bool) -> Vec<SocketAddr> {
        let window = ((self.cfg.max_window + 1).div_ceil(2) + round).min(addrs.len());
        let sorted = self.latency.sorted(addrs, tls).await;
        let mut picks: Vec<SocketAddr> = sorted[..window].to_vec();
        {
            let mut rng = rand::rng();
            picks.extend(addrs.choose_multiple(&mut rng, window).copied());
        }
        let mut seen = HashSet::new();
        picks.retain(|addr| seen.insert(*addr));
        picks
    }

    fn timing(&self) -> DialTiming {
        DialTiming {
            connect_timeout: self.cfg.connect_timeout,
            handshake_timeout: self.cfg.handshake_timeout,
            recv_buffer: self.cfg.recv_buffer,
            penalty_ceiling: self.cfg.timeout_ceiling,
            penalty_jitter: self.cfg.failure_jitter,
        }
    }

    fn exhausted(&self, candidates: usize, first_error: Option<io::Error>) -> ConnectError {
        ConnectError::Exhausted {
            candidates,
            rounds: self.cfg.max_retries,
            first: first_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no attempt completed")),
        }
    }
}

async fn race_once(
    addr: SocketAddr,
    timing: DialTiming,
    latency: &LatencyTable,
) -> io::Result<TcpStream> {
    let started = Instant::now();
    match timeout(timing.connect_timeout, stream::dial(addr, timing.recv_buffer)).await {
        Ok(Ok(conn)) => {
            latency.record_connect(addr, started.elapsed()).await;
            Ok(conn)
        }
        Ok(Err(err)) => {
            latency.record_connect(addr, penalty(timing)).await;
            Err(err)
        }
        Err(_) => {
            latency.record_connect(addr, penalty(timing)).await;
            Err(timed_out("connect timed out"))
        }
    }
}

async fn race_tls_once(
    addr: SocketAddr,
    attempt: TlsAttempt,
    timing: DialTiming,
    latency: &LatencyTable,
) -> io::Result<TlsStream<TcpStream>> {
    let started = Instant::now();
    let conn = match timeout(timing.connect_timeout, stream::dial(addr, timing.recv_buffer)).await
    {
        Ok(Ok(conn)) => conn,
        Ok(Err(err)) => {
            latency.record_handshake(addr, penalty(timing)).await;
            return Err(err);
        }
        Err(_) => {
            latency.record_handshake(addr, penalty(timing)).await;
            return Err(timed_out("connect timed out"));
        }
    };
    latency.record_connect(addr, started.elapsed()).await;

    let handshake = attempt.connector.connect(attempt.server_name.clone(), conn);
    let tls_stream = match timeout(timing.handshake_timeout, handshake).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            latency.record_handshake(addr, penalty(timing)).await;
            return Err(err);
        }
        Err(_) => {
            latency.record_handshake(addr, penalty(timing)).await;
            return Err(timed_out("tls handshake timed out"));
        }
    };
    // handshake latency counts from the start of the dial
    latency.record_handshake(addr, started.elapsed()).await;

    if attempt.check_subject {
        let checked = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "peer presented no certificate")
            })
            .and_then(|leaf| {
                let accepted: Vec<&str> = attempt.accepted.iter().map(String::as_str).collect();
                tls::subject_covers(leaf.as_ref(), &accepted)
            });
        if let Err(err) = checked {
            latency.record_handshake(addr, penalty(timing)).await;
            return Err(err);
        }
    }
    Ok(tls_stream)
}

/// Failure latency: the timeout ceiling plus jitter, so failed addresses
/// sort behind every honest measurement in a stable-but-shuffled order.
fn penalty(timing: DialTiming) -> Duration {
    let jitter_millis = timing.penalty_jitter.as_millis().max(1) as u64;
    timing.penalty_ceiling + Duration::from_millis(rand::rng().random_range(0..jitter_millis))
}

fn timed_out(what: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, what)
}
