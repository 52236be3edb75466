//! Shared relay state: active identity, transport scheme, quirk flag.
//!
//! Mutated as a side effect of relay status codes and read by every
//! in-flight fetch. Callers retry after a downgrade rather than
//! treating it as an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use log::info;
use tokio::sync::Mutex;

use crate::config::{RelayOptions, RelayScheme};

/// One concrete relay target: which identity, where, and over what.
#[derive(Debug, Clone)]
pub struct RelayEndpoint {
    pub index: usize,
    pub host: String,
    pub scheme: RelayScheme,
    pub path: String,
}

impl RelayEndpoint {
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme.as_str(), self.host, self.path)
    }
}

pub struct RelayState {
    options: RelayOptions,
    active: AtomicUsize,
    range_cursor: AtomicUsize,
    tls_only: AtomicBool,
    quirk_enabled: AtomicBool,
    cooldown: Mutex<HashMap<usize, Instant>>,
}

impl RelayState {
    pub fn new(options: RelayOptions) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !options.identities.is_empty(),
            "at least one relay identity is required"
        );
        Ok(RelayState {
            active: AtomicUsize::new(0),
            range_cursor: AtomicUsize::new(0),
            tls_only: AtomicBool::new(options.scheme == RelayScheme::Https),
            quirk_enabled: AtomicBool::new(options.framing_quirk),
            cooldown: Mutex::new(HashMap::new()),
            options,
        })
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    pub fn scheme(&self) -> RelayScheme {
        if self.tls_only.load(Ordering::SeqCst) {
            RelayScheme::Https
        } else {
            RelayScheme::Http
        }
    }

    /// Whether the framing quirk is still enabled at all. The direct
    /// path checks this against the origin's own scheme.
    pub fn quirk_enabled(&self) -> bool {
        self.quirk_enabled.load(Ordering::SeqCst)
    }

    /// The framing quirk only applies on the plaintext relay scheme.
    pub fn quirk_active(&self) -> bool {
        self.quirk_enabled() && self.scheme() == RelayScheme::Http
    }

    /// Turns the quirk off for good. Returns true on the first call.
    pub fn disable_quirk(&self, status: u16) -> bool {
        if self.quirk_enabled.swap(false, Ordering::SeqCst) {
            info!("status {status} rejected the framing quirk, disabling it");
            return true;
        }
        false
    }

    /// Moves every later fetch onto TLS, as after a transport-level
    /// failure on the plaintext scheme. Returns true on the transition.
    pub fn force_tls_only(&self) -> bool {
        if !self.tls_only.swap(true, Ordering::SeqCst) {
            info!("transport failure on the plaintext scheme, switching to TLS-only");
            return true;
        }
        false
    }

    /// Endpoint for the currently active identity.
    pub fn endpoint(&self) -> RelayEndpoint {
        self.endpoint_at(self.active.load(Ordering::SeqCst))
    }

    fn endpoint_at(&self, index: usize) -> RelayEndpoint {
        let index = index % self.options.identities.len();
        RelayEndpoint {
            index,
            host: self.options.identities[index].clone(),
            scheme: self.scheme(),
            path: self.options.path.clone(),
        }
    }

    /// Applies the downgrade rules for a relay status code. Returns
    /// whether anything changed, in which case the caller retries.
    pub fn apply_relay_status(&self, status: u16) -> bool {
        let mut changed = false;
        if matches!(status, 400 | 405) && self.disable_quirk(status) {
            changed = true;
        }
        let scheme_switch = matches!(status, 400 | 504)
            || (status == 502 && self.options.scheme_switch_on_502);
        if scheme_switch && !self.tls_only.swap(true, Ordering::SeqCst) {
            info!("relay answered {status}, switching to the TLS-only scheme");
            changed = true;
        }
        if status == 503 {
            let from = self.active.fetch_add(1, Ordering::SeqCst);
            let len = self.options.identities.len();
            info!(
                "relay identity {} exhausted its quota, rotating to {}",
                self.options.identities[from % len],
                self.options.identities[(from + 1) % len]
            );
            changed = true;
        }
        changed
    }

    /// Remembers how an identity last answered; server errors put it on
    /// cooldown for range workers.
    pub async fn record_result(&self, index: usize, relay_status: u16) {
        let mut cooldown = self.cooldown.lock().await;
        if relay_status >= 500 {
            cooldown.insert(index, Instant::now());
        } else {
            cooldown.remove(&index);
        }
    }

    /// Round-robins identities for range sub-fetches, skipping any that
    /// answered with a server error within the cooldown window. When
    /// everything is cooling down the next in line is used anyway.
    pub async fn pick_for_range(&self) -> RelayEndpoint {
        let len = self.options.identities.len();
        let start = self.range_cursor.fetch_add(1, Ordering::SeqCst);
        let cooldown = self.cooldown.lock().await;
        for offset in 0..len {
            let index = (start + offset) % len;
            match cooldown.get(&index) {
                Some(since) if since.elapsed() < self.options.cooldown => continue,
                _ => return self.endpoint_at(index),
            }
        }
        self.endpoint_at(start % len)
    }
}
