//! Write-through replication of dialog and transaction state
//!
//! Every lifecycle event is handled under the dialog's [`KeyedLocks`] entry,
//! so writes for one dialog are strictly ordered while different dialogs
//! replicate concurrently. A dialog write is a compare-and-swap against the
//! version this node last wrote:
//!
//! ```text
//! encode ──→ CAS(previous) ──ok──→ Written
//!                 │
//!             conflict ──→ re-read ──remote TERMINATED / purged──→ Superseded
//!                              │
//!                              ├──absent, not terminated here──→ CAS(absent) ──→ Written
//!                              │
//!                              └──→ merge, CAS(remote) once ──→ Written | error
//! ```
//!
//! A backend outage never fails the call: the latest snapshot per dialog is
//! parked and flushed later by [`ReplicationManager::resync_pending`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tracing::{debug, info, warn};

use crate::cache::{dialog_state_key, transaction_key, CacheAdapter};
use crate::codec::{DialogSnapshot, SnapshotCodec};
use crate::config::HaConfig;
use crate::dialog::{DialogKey, LiveDialog};
use crate::errors::{HaError, HaResult};
use crate::events::DialogLifecycleEvent;
use crate::ownership::{KeyedLocks, LeaseManager, NodeId};
use crate::scheduler::DeferredActions;
use crate::transaction::TransactionSnapshot;

use super::{ReplicationStats, ReplicationStatsSnapshot};

/// Purge attempts before a terminated snapshot is left to its TTL
const MAX_PURGE_ATTEMPTS: u32 = 5;

/// What happened to one lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// Written at this version
    Written { version: u64 },
    /// Filtered out by the replication strategy
    Skipped,
    /// Discarded in favour of newer or terminal remote state
    Superseded,
    /// Backend unavailable; parked for a later resync
    Degraded,
    /// Record removed
    Removed,
}

/// Consumes lifecycle events and writes snapshots through to the cache
#[derive(Debug)]
pub struct ReplicationManager {
    node_id: NodeId,
    codec: SnapshotCodec,
    store: Arc<CacheAdapter>,
    leases: Arc<LeaseManager>,
    locks: Arc<KeyedLocks>,
    purges: DeferredActions,
    grace_period: Duration,
    snapshot_ttl: Option<Duration>,
    /// Last version this node wrote or adopted, per dialog
    versions: DashMap<DialogKey, u64>,
    /// Latest snapshot that could not be written yet
    pending: DashMap<DialogKey, DialogSnapshot>,
    /// Dialogs created while the backend was down; lease still to acquire
    needs_lease: DashSet<DialogKey>,
    /// Dialogs known to be terminated
    tombstones: DashSet<DialogKey>,
    stats: ReplicationStats,
}

impl ReplicationManager {
    pub fn new(
        config: &HaConfig,
        store: Arc<CacheAdapter>,
        leases: Arc<LeaseManager>,
        locks: Arc<KeyedLocks>,
    ) -> Self {
        Self {
            node_id: config.node_id.clone(),
            codec: SnapshotCodec::new(config.replication_strategy),
            store,
            leases,
            locks,
            purges: DeferredActions::new(format!("{} purge", config.node_id)),
            grace_period: config.termination_grace_period,
            snapshot_ttl: config.snapshot_ttl,
            versions: DashMap::new(),
            pending: DashMap::new(),
            needs_lease: DashSet::new(),
            tombstones: DashSet::new(),
            stats: ReplicationStats::default(),
        }
    }

    pub fn codec(&self) -> &SnapshotCodec {
        &self.codec
    }

    /// Handle one lifecycle event
    pub async fn dispatch(self: &Arc<Self>, event: DialogLifecycleEvent) -> HaResult<ReplicationOutcome> {
        debug!("[{}] Replicating {} for {:?}", self.node_id, event.kind(), event.dialog_key());
        match event {
            DialogLifecycleEvent::DialogCreated { dialog } => self.on_dialog_created(dialog).await,
            DialogLifecycleEvent::DialogStateChanged { dialog } => self.on_dialog_changed(dialog).await,
            DialogLifecycleEvent::DialogTerminated { dialog, reason } => {
                self.on_dialog_terminated(dialog, &reason).await
            }
            DialogLifecycleEvent::TransactionStateChanged { transaction } => {
                self.on_transaction_changed(transaction).await
            }
            DialogLifecycleEvent::TransactionTerminated { transaction } => {
                self.on_transaction_terminated(transaction).await
            }
        }
    }

    async fn on_dialog_created(&self, dialog: LiveDialog) -> HaResult<ReplicationOutcome> {
        let key = dialog.key.clone();
        let _guard = self.locks.lock(&key).await;
        let snapshot = self.codec.snapshot(&dialog);

        match self.leases.acquire_locked(&key).await {
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                warn!("[{}] No lease for new dialog {} yet: {}", self.node_id, key, e);
                self.needs_lease.insert(key);
                return Ok(self.park(snapshot));
            }
            Err(e) => return Err(e),
        }
        self.write_locked(snapshot).await
    }

    async fn on_dialog_changed(&self, dialog: LiveDialog) -> HaResult<ReplicationOutcome> {
        let key = dialog.key.clone();
        let _guard = self.locks.lock(&key).await;
        if self.tombstones.contains(&key) {
            debug!("[{}] Ignoring update of terminated dialog {}", self.node_id, key);
            return Ok(ReplicationOutcome::Superseded);
        }
        let snapshot = self.codec.snapshot(&dialog);
        if self.needs_lease.contains(&key) {
            return Ok(self.park(snapshot));
        }
        self.leases.ensure_owner(&key)?;
        self.write_locked(snapshot).await
    }

    async fn on_dialog_terminated(self: &Arc<Self>, dialog: LiveDialog, reason: &str) -> HaResult<ReplicationOutcome> {
        let key = dialog.key.clone();
        let guard = self.locks.lock(&key).await;
        if self.tombstones.contains(&key) {
            return Ok(ReplicationOutcome::Superseded);
        }

        let snapshot = self.codec.snapshot(&dialog);
        let outcome = if self.needs_lease.contains(&key) {
            self.tombstones.insert(key.clone());
            self.park(snapshot)
        } else {
            self.leases.ensure_owner(&key)?;
            self.tombstones.insert(key.clone());
            self.write_locked(snapshot).await?
        };
        drop(guard);

        info!(
            "[{}] Dialog {} terminated ({}), purging in {:?}",
            self.node_id, key, reason, self.grace_period
        );
        self.schedule_purge(&key, 1);
        Ok(outcome)
    }

    async fn on_transaction_changed(&self, transaction: TransactionSnapshot) -> HaResult<ReplicationOutcome> {
        if let Some(dialog) = &transaction.dialog {
            self.leases.ensure_owner(dialog)?;
        }
        let bytes = self.codec.encode_transaction(&transaction)?;
        // Transactions live no longer than the termination grace period
        match self
            .store
            .put(&transaction_key(&transaction.branch), bytes, Some(self.grace_period))
            .await
        {
            Ok(version) => {
                self.stats.transaction();
                Ok(ReplicationOutcome::Written { version })
            }
            Err(e) if e.is_transient() => {
                self.stats.degraded();
                Ok(ReplicationOutcome::Degraded)
            }
            Err(e) => Err(e),
        }
    }

    async fn on_transaction_terminated(&self, transaction: TransactionSnapshot) -> HaResult<ReplicationOutcome> {
        match self.store.remove(&transaction_key(&transaction.branch)).await {
            Ok(()) => {
                self.stats.transaction();
                Ok(ReplicationOutcome::Removed)
            }
            Err(e) if e.is_transient() => {
                self.stats.degraded();
                Ok(ReplicationOutcome::Degraded)
            }
            Err(e) => Err(e),
        }
    }

    /// Write a snapshot; the caller holds the dialog's lock
    async fn write_locked(&self, mut snapshot: DialogSnapshot) -> HaResult<ReplicationOutcome> {
        let key = snapshot.key();
        let previous = self.versions.get(&key).map(|v| *v);

        if !self.codec.strategy().admits(snapshot.state, previous.is_some()) {
            debug!("[{}] {} snapshot of {} not replicated", self.node_id, snapshot.state, key);
            self.stats.skipped();
            return Ok(ReplicationOutcome::Skipped);
        }

        snapshot.version = previous.unwrap_or(0) + 1;
        let bytes = self.codec.encode(&snapshot)?;
        let storage_key = dialog_state_key(&key);
        match self
            .store
            .compare_and_swap(&storage_key, previous, bytes, self.snapshot_ttl)
            .await
        {
            Ok(version) => Ok(self.written(&key, version)),
            Err(HaError::VersionConflict { actual, .. }) => {
                warn!(
                    "[{}] Version conflict on {}: wrote against {:?}, found {:?}",
                    self.node_id, key, previous, actual
                );
                self.stats.conflict();
                self.resolve_conflict(snapshot).await
            }
            Err(e) if e.is_transient() => Ok(self.park(snapshot)),
            Err(e) => Err(e),
        }
    }

    /// Terminal state wins; otherwise merge onto the remote version and retry once
    async fn resolve_conflict(&self, mut snapshot: DialogSnapshot) -> HaResult<ReplicationOutcome> {
        let key = snapshot.key();
        let storage_key = dialog_state_key(&key);

        let remote = match self.store.get(&storage_key).await {
            Ok(remote) => remote,
            Err(e) if e.is_transient() => return Ok(self.park(snapshot)),
            Err(e) => return Err(e),
        };
        let Some(entry) = remote else {
            if self.tombstones.contains(&key) {
                info!("[{}] Snapshot of {} was purged meanwhile, discarding write", self.node_id, key);
                self.versions.remove(&key);
                self.stats.superseded();
                return Ok(ReplicationOutcome::Superseded);
            }
            // Expired under its TTL while the dialog stayed live
            info!("[{}] Snapshot of {} expired, writing it again", self.node_id, key);
            return self.recreate(snapshot).await;
        };

        match self.codec.decode(&key, &entry.value) {
            Ok(theirs) => {
                if theirs.is_terminated() || theirs.state > snapshot.state {
                    warn!(
                        "[{}] Remote {} snapshot of {} (version {}) supersedes local {}",
                        self.node_id, theirs.state, key, entry.version, snapshot.state
                    );
                    if theirs.is_terminated() {
                        self.tombstones.insert(key.clone());
                    }
                    self.versions.insert(key, entry.version);
                    self.stats.superseded();
                    return Ok(ReplicationOutcome::Superseded);
                }
                snapshot.local_seq = snapshot.local_seq.max(theirs.local_seq);
                snapshot.remote_seq = snapshot.remote_seq.max(theirs.remote_seq);
            }
            // Unreadable remote state: overwrite it with ours
            Err(e) => warn!("[{}] Overwriting unreadable snapshot of {}: {}", self.node_id, key, e),
        }

        snapshot.version = entry.version + 1;
        let bytes = self.codec.encode(&snapshot)?;
        match self
            .store
            .compare_and_swap(&storage_key, Some(entry.version), bytes, self.snapshot_ttl)
            .await
        {
            Ok(version) => Ok(self.written(&key, version)),
            Err(e) if e.is_transient() => Ok(self.park(snapshot)),
            Err(e) => {
                self.stats.conflict();
                Err(e)
            }
        }
    }

    async fn recreate(&self, snapshot: DialogSnapshot) -> HaResult<ReplicationOutcome> {
        let key = snapshot.key();
        let bytes = self.codec.encode(&snapshot)?;
        match self
            .store
            .compare_and_swap(&dialog_state_key(&key), None, bytes, self.snapshot_ttl)
            .await
        {
            Ok(version) => Ok(self.written(&key, version)),
            Err(e) if e.is_transient() => Ok(self.park(snapshot)),
            Err(e) => {
                self.stats.conflict();
                Err(e)
            }
        }
    }

    fn written(&self, key: &DialogKey, version: u64) -> ReplicationOutcome {
        debug!("[{}] Wrote snapshot of {} at version {}", self.node_id, key, version);
        self.versions.insert(key.clone(), version);
        self.pending.remove(key);
        self.stats.write();
        ReplicationOutcome::Written { version }
    }

    fn park(&self, snapshot: DialogSnapshot) -> ReplicationOutcome {
        debug!("[{}] Parking snapshot of {} until the backend returns", self.node_id, snapshot.key());
        self.pending.insert(snapshot.key(), snapshot);
        self.stats.degraded();
        ReplicationOutcome::Degraded
    }

    /// Flush parked snapshots; returns how many were written
    pub async fn resync_pending(&self) -> usize {
        let keys: Vec<DialogKey> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        let mut flushed = 0;

        for key in keys {
            let _guard = self.locks.lock(&key).await;
            let Some((_, snapshot)) = self.pending.remove(&key) else {
                continue;
            };

            if self.needs_lease.contains(&key) {
                match self.leases.acquire_locked(&key).await {
                    Ok(_) => {
                        self.needs_lease.remove(&key);
                    }
                    Err(e) if e.is_transient() => {
                        self.pending.insert(key, snapshot);
                        continue;
                    }
                    Err(e) => {
                        warn!("[{}] Dropping parked snapshot of {}: {}", self.node_id, key, e);
                        self.needs_lease.remove(&key);
                        continue;
                    }
                }
            } else if !self.leases.holds_valid_lease(&key) {
                warn!("[{}] Dropping parked snapshot of {}: lease lost", self.node_id, key);
                continue;
            }

            match self.write_locked(snapshot).await {
                Ok(ReplicationOutcome::Written { version }) => {
                    info!("[{}] Resynced {} at version {}", self.node_id, key, version);
                    self.stats.resynced();
                    flushed += 1;
                }
                Ok(_) => {}
                Err(e) => warn!("[{}] Resync of {} failed: {}", self.node_id, key, e),
            }
        }
        flushed
    }

    fn schedule_purge(self: &Arc<Self>, key: &DialogKey, attempt: u32) {
        let this = Arc::clone(self);
        let target = key.clone();
        self.purges.schedule(key, "purge", self.grace_period, async move {
            this.purge(target, attempt).await;
        });
    }

    async fn purge(self: Arc<Self>, key: DialogKey, attempt: u32) {
        let guard = self.locks.lock(&key).await;
        let result = match self.store.remove(&dialog_state_key(&key)).await {
            Ok(()) => self.leases.remove_record_locked(&key).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.versions.remove(&key);
                self.pending.remove(&key);
                self.needs_lease.remove(&key);
                self.tombstones.remove(&key);
                self.stats.purged();
                info!("[{}] Purged terminated dialog {}", self.node_id, key);
                drop(guard);
                self.locks.forget(&key);
            }
            Err(e) if attempt < MAX_PURGE_ATTEMPTS => {
                warn!("[{}] Purge of {} failed (attempt {}): {}", self.node_id, key, attempt, e);
                drop(guard);
                self.schedule_purge(&key, attempt + 1);
            }
            Err(e) => warn!("[{}] Giving up purge of {}: {}", self.node_id, key, e),
        }
    }

    /// Continue the version sequence of a recovered dialog
    pub fn seed_version(&self, key: &DialogKey, version: u64) {
        self.versions.insert(key.clone(), version);
    }

    /// Forget local replication state of a dialog this node no longer owns
    pub fn forget(&self, key: &DialogKey) {
        self.versions.remove(key);
        self.pending.remove(key);
        self.needs_lease.remove(key);
    }

    /// Read a replicated transaction
    pub async fn fetch_transaction(&self, branch: &str) -> HaResult<Option<TransactionSnapshot>> {
        match self.store.get(&transaction_key(branch)).await? {
            Some(entry) => self.codec.decode_transaction(branch, &entry.value).map(Some),
            None => Ok(None),
        }
    }

    /// Last version this node wrote or adopted for `key`
    pub fn version_of(&self, key: &DialogKey) -> Option<u64> {
        self.versions.get(key).map(|v| *v)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_terminated(&self, key: &DialogKey) -> bool {
        self.tombstones.contains(key)
    }

    pub fn pending_purges(&self) -> usize {
        self.purges.total_pending()
    }

    pub fn stats(&self) -> ReplicationStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop scheduled purges
    pub fn shutdown(&self) {
        self.purges.shutdown();
    }
}
