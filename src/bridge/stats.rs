//! Relay counters

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated from the forwarding path and the supervisor
#[derive(Debug, Default)]
pub struct RelayStats {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    reconnect_attempts: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub forwarded: u64,
    /// Not forwarded because downstream was unavailable
    pub dropped: u64,
    /// Publish failures and handler panics
    pub failed: u64,
    pub reconnect_attempts: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the attempt number
    pub(crate) fn record_reconnect(&self) -> u64 {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "forwarded={} dropped={} failed={} reconnects={}",
            self.forwarded, self.dropped, self.failed, self.reconnect_attempts
        )
    }
}
