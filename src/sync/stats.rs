//! Session counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every task of one session.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub uploads_committed: AtomicU64,
    pub downloads_applied: AtomicU64,
    pub deletes_sent: AtomicU64,
    pub deletes_applied: AtomicU64,
    pub transfers_rejected: AtomicU64,
    pub reconnects: AtomicU64,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uploads_committed: self.uploads_committed.load(Ordering::Relaxed),
            downloads_applied: self.downloads_applied.load(Ordering::Relaxed),
            deletes_sent: self.deletes_sent.load(Ordering::Relaxed),
            deletes_applied: self.deletes_applied.load(Ordering::Relaxed),
            transfers_rejected: self.transfers_rejected.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub uploads_committed: u64,
    pub downloads_applied: u64,
    pub deletes_sent: u64,
    pub deletes_applied: u64,
    pub transfers_rejected: u64,
    pub reconnects: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}
