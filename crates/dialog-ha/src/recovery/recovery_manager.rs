//! Rehydration of replicated dialogs on a surviving node
//!
//! Recovery of one dialog runs these steps, each with its own failure:
//!
//! 1. read `dialog-state/<key>`: absent → `UnknownDialog`
//! 2. decode: corrupt → `RecoveryFailed`
//! 3. acquire the lease: live foreign lease → `OwnershipConflict`
//! 4. bind to the local engine: failure → lease released, `RecoveryFailed`
//!
//! The engine is asked for the dialog before and after taking the dialog's
//! lock, so concurrent recoveries of the same key bind it exactly once.
//!
//! A node that still holds a dialog but let its lease lapse goes through
//! [`FailoverRecoveryManager::reclaim`] instead, which catches the local
//! dialog up with whatever a peer wrote meanwhile.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::cache::{dialog_state_key, CacheAdapter};
use crate::codec::SnapshotCodec;
use crate::dialog::DialogKey;
use crate::engine::{SipEngine, TransportContext};
use crate::errors::{HaError, HaResult};
use crate::ownership::{KeyedLocks, LeaseManager};
use crate::replication::ReplicationManager;

/// Result of a successful recovery call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The engine already had the dialog; nothing was read
    AlreadyBound,
    /// The snapshot at `version` was bound to this node
    Recovered { version: u64 },
}

/// Recovers dialogs owned by failed nodes
pub struct FailoverRecoveryManager {
    store: Arc<CacheAdapter>,
    codec: SnapshotCodec,
    leases: Arc<LeaseManager>,
    locks: Arc<KeyedLocks>,
    replication: Arc<ReplicationManager>,
    engine: Arc<dyn SipEngine>,
    transport: TransportContext,
    recovered: AtomicU64,
}

impl std::fmt::Debug for FailoverRecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverRecoveryManager")
            .field("node", &self.transport.node_id)
            .field("recovered", &self.recovered.load(Ordering::Relaxed))
            .finish()
    }
}

impl FailoverRecoveryManager {
    pub fn new(
        store: Arc<CacheAdapter>,
        leases: Arc<LeaseManager>,
        locks: Arc<KeyedLocks>,
        replication: Arc<ReplicationManager>,
        engine: Arc<dyn SipEngine>,
        transport: TransportContext,
    ) -> Self {
        Self {
            store,
            codec: *replication.codec(),
            leases,
            locks,
            replication,
            engine,
            transport,
            recovered: AtomicU64::new(0),
        }
    }

    /// Recover one dialog; idempotent
    pub async fn recover(&self, key: &DialogKey) -> HaResult<RecoveryOutcome> {
        if self.engine.has_dialog(key).await {
            return Ok(RecoveryOutcome::AlreadyBound);
        }

        let _guard = self.locks.lock(key).await;
        if self.engine.has_dialog(key).await {
            debug!("Dialog {} was bound while waiting for its lock", key);
            return Ok(RecoveryOutcome::AlreadyBound);
        }
        if self.replication.is_terminated(key) {
            return Err(HaError::UnknownDialog { key: key.clone() });
        }

        let entry = self
            .store
            .get(&dialog_state_key(key))
            .await?
            .ok_or_else(|| HaError::UnknownDialog { key: key.clone() })?;

        let snapshot = self.codec.decode(key, &entry.value).map_err(|e| HaError::RecoveryFailed {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        if snapshot.is_terminated() {
            debug!("Not recovering terminated dialog {}", key);
            return Err(HaError::UnknownDialog { key: key.clone() });
        }

        let lease = self.leases.acquire_locked(key).await?;
        self.replication.seed_version(key, entry.version);

        match self.engine.bind_recovered_dialog(&snapshot, &self.transport).await {
            Ok(true) => {
                self.recovered.fetch_add(1, Ordering::Relaxed);
                info!(
                    "[{}] Recovered dialog {} in state {} (version {}, lease until {})",
                    self.transport.node_id, key, snapshot.state, entry.version, lease.expires_at_ms
                );
                Ok(RecoveryOutcome::Recovered { version: entry.version })
            }
            Ok(false) => Ok(RecoveryOutcome::AlreadyBound),
            Err(e) => {
                warn!("[{}] Binding recovered dialog {} failed: {}", self.transport.node_id, key, e);
                self.replication.forget(key);
                if let Err(release) = self.leases.release_locked(key).await {
                    warn!("Could not release lease for {} after failed recovery: {}", key, release);
                }
                Err(HaError::RecoveryFailed { key: key.clone(), reason: e.to_string() })
            }
        }
    }

    /// Take back the lease of a dialog the engine still holds
    ///
    /// A peer may have served the dialog while this node's lease had lapsed.
    /// When the cache holds a newer snapshot than the one this node last
    /// wrote, the local dialog catches up to it before anything is sent.
    pub async fn reclaim(&self, key: &DialogKey) -> HaResult<()> {
        let _guard = self.locks.lock(key).await;
        let lease = self.leases.acquire_locked(key).await?;

        let Some(entry) = self.store.get(&dialog_state_key(key)).await? else {
            return Ok(());
        };
        if self.replication.version_of(key).is_some_and(|ours| ours >= entry.version) {
            return Ok(());
        }

        let snapshot = self.codec.decode(key, &entry.value).map_err(|e| HaError::RecoveryFailed {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        if self.engine.catch_up_dialog(&snapshot).await? {
            info!(
                "[{}] Caught up dialog {} to version {} on reclaiming it (lease until {})",
                self.transport.node_id, key, entry.version, lease.expires_at_ms
            );
        }
        self.replication.seed_version(key, entry.version);
        if snapshot.is_terminated() {
            return Err(HaError::UnknownDialog { key: key.clone() });
        }
        Ok(())
    }

    /// Recover several dialogs concurrently; one failure does not affect the others
    pub async fn recover_many(&self, keys: &[DialogKey]) -> Vec<(DialogKey, HaResult<RecoveryOutcome>)> {
        let results = join_all(keys.iter().map(|key| self.recover(key))).await;
        keys.iter().cloned().zip(results).collect()
    }

    /// Dialogs this manager has bound so far
    pub fn recovered_count(&self) -> u64 {
        self.recovered.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::cache::InMemoryCache;
    use crate::codec::DialogSnapshot;
    use crate::config::{HaConfig, RetryPolicy};
    use crate::dialog::{DialogState, DialogTable, SubscriptionState};
    use crate::message::{SipRequest, SipResponse, SipUri};
    use crate::ownership::{ManualClock, NodeId};

    /// Engine backed by a plain dialog table
    struct TableEngine {
        table: DialogTable,
        fail_bind: bool,
        binds: Mutex<usize>,
    }

    #[async_trait]
    impl SipEngine for TableEngine {
        async fn has_dialog(&self, key: &DialogKey) -> bool {
            self.table.contains(key)
        }

        async fn bind_recovered_dialog(&self, snapshot: &DialogSnapshot, _: &TransportContext) -> HaResult<bool> {
            if self.fail_bind {
                return Err(HaError::internal("engine refused the dialog"));
            }
            // Widen the race window for concurrent recoveries
            tokio::task::yield_now().await;
            *self.binds.lock() += 1;
            self.table.bind_recovered(snapshot)
        }

        async fn catch_up_dialog(&self, snapshot: &DialogSnapshot) -> HaResult<bool> {
            self.table.catch_up(snapshot)
        }

        async fn send_request(&self, _: SipRequest) -> HaResult<()> {
            Ok(())
        }

        async fn send_response(&self, _: SipResponse) -> HaResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<CacheAdapter>,
        clock: Arc<ManualClock>,
        engine: Arc<TableEngine>,
        leases: Arc<LeaseManager>,
        recovery: FailoverRecoveryManager,
    }

    fn fixture(fail_bind: bool) -> Fixture {
        let cache = Arc::new(InMemoryCache::new());
        let clock = Arc::new(ManualClock::default());
        let config = HaConfig::new("node-b");
        let store = Arc::new(CacheAdapter::new(cache, Duration::from_millis(500), RetryPolicy::none()));
        let locks = Arc::new(KeyedLocks::new());
        let leases = Arc::new(LeaseManager::new(
            config.node_id.clone(),
            store.clone(),
            clock.clone(),
            locks.clone(),
            config.lease_duration,
            config.lease_safety_margin,
        ));
        let replication = Arc::new(ReplicationManager::new(&config, store.clone(), leases.clone(), locks.clone()));
        let transport = TransportContext::new(config.node_id.clone(), SipUri::new("127.0.0.1", Some(5080)));
        let engine = Arc::new(TableEngine {
            table: DialogTable::new(transport.clone()),
            fail_bind,
            binds: Mutex::new(0),
        });
        let recovery = FailoverRecoveryManager::new(
            store.clone(),
            leases.clone(),
            locks,
            replication,
            engine.clone(),
            transport,
        );
        Fixture { store, clock, engine, leases, recovery }
    }

    fn key() -> DialogKey {
        DialogKey::new("call-1", "4321", "12345")
    }

    fn snapshot(state: DialogState) -> DialogSnapshot {
        DialogSnapshot {
            call_id: "call-1".to_string(),
            local_tag: "4321".to_string(),
            remote_tag: "12345".to_string(),
            state,
            local_seq: 1,
            remote_seq: 2,
            route_set: vec!["sip:127.0.0.1:5050;lr".to_string()],
            local_uri: "sip:LittleGuy@there.com".to_string(),
            remote_uri: "sip:BigGuy@here.com".to_string(),
            remote_target: "sip:BigGuy@127.0.0.1:5060".to_string(),
            is_initiator: false,
            subscription_state: SubscriptionState::None,
            application_data: BTreeMap::new(),
            version: 1,
        }
    }

    async fn seed(fixture: &Fixture, state: DialogState) {
        let bytes = SnapshotCodec::default().encode(&snapshot(state)).unwrap();
        fixture.store.put(&dialog_state_key(&key()), bytes, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_binds_and_takes_lease() {
        let f = fixture(false);
        seed(&f, DialogState::Confirmed).await;

        let outcome = f.recovery.recover(&key()).await.unwrap();

        assert_eq!(outcome, RecoveryOutcome::Recovered { version: 1 });
        assert!(f.engine.table.contains(&key()));
        assert!(f.leases.holds_valid_lease(&key()));
        assert_eq!(f.engine.table.get(&key()).unwrap().remote_seq, 2);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_unknown_dialog() {
        let f = fixture(false);
        let err = f.recovery.recover(&key()).await.unwrap_err();
        assert_eq!(err, HaError::UnknownDialog { key: key() });
        assert!(!f.leases.holds_valid_lease(&key()));
    }

    #[tokio::test]
    async fn test_terminated_snapshot_is_not_rehydrated() {
        let f = fixture(false);
        seed(&f, DialogState::Terminated).await;
        let err = f.recovery.recover(&key()).await.unwrap_err();
        assert_eq!(err, HaError::UnknownDialog { key: key() });
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_fails_recovery() {
        let f = fixture(false);
        f.store
            .put(&dialog_state_key(&key()), Bytes::from_static(b"{not json"), None)
            .await
            .unwrap();
        let err = f.recovery.recover(&key()).await.unwrap_err();
        assert!(matches!(err, HaError::RecoveryFailed { .. }));
        assert!(!f.leases.holds_valid_lease(&key()));
    }

    #[tokio::test]
    async fn test_live_foreign_lease_blocks_recovery() {
        let f = fixture(false);
        seed(&f, DialogState::Confirmed).await;
        let other = LeaseManager::new(
            NodeId::new("node-a"),
            f.store.clone(),
            f.clock.clone(),
            Arc::new(KeyedLocks::new()),
            Duration::from_secs(30),
            Duration::from_secs(1),
        );
        other.acquire(&key()).await.unwrap();

        let err = f.recovery.recover(&key()).await.unwrap_err();
        assert_eq!(err, HaError::OwnershipConflict { key: key(), owner: NodeId::new("node-a") });
        assert!(!f.engine.table.contains(&key()));

        f.clock.advance(Duration::from_secs(31));
        assert!(matches!(f.recovery.recover(&key()).await, Ok(RecoveryOutcome::Recovered { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_recoveries_bind_once() {
        let f = fixture(false);
        seed(&f, DialogState::Confirmed).await;

        let key = key();
        let (first, second) = tokio::join!(f.recovery.recover(&key), f.recovery.recover(&key));
        let mut outcomes = vec![first.unwrap(), second.unwrap()];
        outcomes.sort_by_key(|o| matches!(o, RecoveryOutcome::Recovered { .. }));

        assert_eq!(outcomes, vec![RecoveryOutcome::AlreadyBound, RecoveryOutcome::Recovered { version: 1 }]);
        assert_eq!(*f.engine.binds.lock(), 1);
        assert_eq!(f.recovery.recovered_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_bind_releases_lease() {
        let f = fixture(true);
        seed(&f, DialogState::Confirmed).await;

        let err = f.recovery.recover(&key()).await.unwrap_err();
        assert!(matches!(err, HaError::RecoveryFailed { .. }));
        assert!(!f.leases.holds_valid_lease(&key()));
        assert!(f.leases.current_owner(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_many_isolates_corrupt_keys() {
        let f = fixture(false);
        seed(&f, DialogState::Confirmed).await;
        let broken = DialogKey::new("call-2", "a", "b");
        f.store
            .put(&dialog_state_key(&broken), Bytes::from_static(b"garbage"), None)
            .await
            .unwrap();

        let results = f.recovery.recover_many(&[key(), broken.clone()]).await;

        assert!(matches!(results[0], (_, Ok(RecoveryOutcome::Recovered { .. }))));
        assert!(matches!(&results[1], (k, Err(HaError::RecoveryFailed { .. })) if *k == broken));
    }
}
