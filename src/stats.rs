//! Statistics tracking for the daemon.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Atomic query counters, incremented from every handling path and cleared
/// only on process restart.
pub struct Stats {
    queries: AtomicU64,
    blocked: AtomicU64,
    allowed: AtomicU64,
    errors: AtomicU64,
    started: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            queries: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    /// Malformed packets and failed forwards.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub queries: u64,
    pub blocked: u64,
    pub allowed: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new();
        stats.record_query();
        stats.record_query();
        stats.record_blocked();
        stats.record_allowed();
        stats.record_error();

        let snap = stats.snapshot();
        assert_eq!(snap.queries, 2);
        assert_eq!(snap.blocked, 1);
        assert_eq!(snap.allowed, 1);
        assert_eq!(snap.errors, 1);
    }

    #[test]
    fn snapshot_does_not_reset() {
        let stats = Stats::new();
        stats.record_query();
        let _ = stats.snapshot();

        assert_eq!(stats.snapshot().queries, 1);
    }
}
