//! Replication counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by the replication manager
#[derive(Debug, Default)]
pub struct ReplicationStats {
    writes: AtomicU64,
    conflicts: AtomicU64,
    superseded: AtomicU64,
    skipped: AtomicU64,
    degraded: AtomicU64,
    resynced: AtomicU64,
    purged: AtomicU64,
    transactions: AtomicU64,
}

/// Point-in-time copy of [`ReplicationStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplicationStatsSnapshot {
    /// Snapshots written successfully
    pub writes: u64,
    /// Writes that hit a version conflict
    pub conflicts: u64,
    /// Local writes discarded in favour of a remote terminal state
    pub superseded: u64,
    /// Events the replication strategy filtered out
    pub skipped: u64,
    /// Writes parked because the backend was unavailable
    pub degraded: u64,
    /// Parked writes later flushed by a resync
    pub resynced: u64,
    /// Terminated dialogs removed from the cache
    pub purged: u64,
    /// Transaction records written or removed
    pub transactions: u64,
}

impl ReplicationStats {
    pub(crate) fn write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn superseded(&self) {
        self.superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn resynced(&self) {
        self.resynced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn purged(&self) {
        self.purged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transaction(&self) {
        self.transactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReplicationStatsSnapshot {
        ReplicationStatsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            resynced: self.resynced.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
        }
    }
}
