//! Per-address latency bookkeeping for candidate ordering.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::Mutex;

#[derive(Clone, Copy, Default)]
struct AddrLatency {
    connect: Option<Duration>,
    handshake: Option<Duration>,
}

/// Remembers how long each address took to connect and to complete a
/// TLS handshake. Failed attempts are recorded with a penalty value
/// above any honest measurement, so an address that just failed sinks
/// to the back of the ordering without being excluded outright.
#[derive(Default)]
pub struct LatencyTable {
    entries: Mutex<HashMap<SocketAddr, AddrLatency>>,
}

impl LatencyTable {
    pub async fn record_connect(&self, addr: SocketAddr, elapsed: Duration) {
        self.entries.lock().await.entry(addr).or_default().connect = Some(elapsed);
    }

    pub async fn record_handshake(&self, addr: SocketAddr, elapsed: Duration) {
        self.entries.lock().await.entry(addr).or_default().handshake = Some(elapsed);
    }

    /// Returns `addrs` ordered fastest-first. Unmeasured addresses sort
    /// ahead of everything so new candidates get tried early. For the
    /// TLS ordering the handshake time is preferred, falling back to
    /// the connect time when only that was measured.
    pub async fn sorted(&self, addrs: &[SocketAddr], tls: bool) -> Vec<SocketAddr> {
        let entries = self.entries.lock().await;
        let mut ordered = addrs.to_vec();
        ordered.sort_by_key(|addr| {
            let entry = entries.get(addr).copied().unwrap_or_default();
            let measured = if tls {
                entry.handshake.or(entry.connect)
            } else {
                entry.connect
            };
            measured.unwrap_or(Duration::ZERO)
        });
        ordered
    }
}
