//! Failure counters for the engine's summary logging.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use strum::IntoEnumIterator;

use super::types::ErrorKind;

/// Thread-safe failure counters, one per [`ErrorKind`], shared across
/// request tasks via `Arc`. All kinds are initialized to zero.
pub struct TunnelStats {
    counters: HashMap<ErrorKind, AtomicUsize>,
}

impl TunnelStats {
    pub fn new() -> Self {
        let mut counters = HashMap::new();
        for kind in ErrorKind::iter() {
            counters.insert(kind, AtomicUsize::new(0));
        }
        TunnelStats { counters }
    }

    pub fn record(&self, kind: ErrorKind) {
        if let Some(counter) = self.counters.get(&kind) {
            counter.fetch_add(1, Ordering::Relaxed);
        } else {
            log::error!(
                "no counter for {:?}; TunnelStats was not initialized via new()",
                kind
            );
        }
    }

    pub fn count(&self, kind: ErrorKind) -> usize {
        self.counters
            .get(&kind)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        ErrorKind::iter().map(|k| self.count(k)).sum()
    }

    /// One line per non-zero counter, for periodic `info` logs.
    pub fn summary(&self) -> String {
        let parts: Vec<String> = ErrorKind::iter()
            .filter_map(|k| {
                let n = self.count(k);
                (n > 0).then(|| format!("{}={}", k.as_str(), n))
            })
            .collect();
        if parts.is_empty() {
            "no failures".to_string()
        } else {
            parts.join(" ")
        }
    }
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let stats = TunnelStats::new();
        assert_eq!(stats.total(), 0);
        stats.record(ErrorKind::Connect);
        stats.record(ErrorKind::Connect);
        stats.record(ErrorKind::RelayStatus);
        assert_eq!(stats.count(ErrorKind::Connect), 2);
        assert_eq!(stats.count(ErrorKind::RelayStatus), 1);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn summary_lists_only_nonzero() {
        let stats = TunnelStats::new();
        assert_eq!(stats.summary(), "no failures");
        stats.record(ErrorKind::ClientAbort);
        assert_eq!(stats.summary(), "client_abort=1");
    }
}
