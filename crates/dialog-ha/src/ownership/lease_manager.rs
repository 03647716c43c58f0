//! Dialog ownership leases
//!
//! ```text
//! UNCLAIMED ──acquire──→ CLAIMED(node, expiry) ──renew──→ CLAIMED(node, expiry')
//!     ↑                        │         │
//!     └──────── release ───────┘         └── expiry passes ──→ UNCLAIMED
//! ```
//!
//! Ownership records live in the cache and every transition is a
//! compare-and-swap on the record, so two nodes racing for the same dialog
//! cannot both win. Locally the manager remembers the leases it holds and
//! judges their validity with a safety margin, so a node stops acting as
//! owner slightly before its lease actually runs out.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::cache::{ownership_key, CacheAdapter};
use crate::dialog::DialogKey;
use crate::errors::{HaError, HaResult};

use super::{Clock, KeyedLocks, Lease, NodeId, OwnershipRecord};

/// How often `acquire` retries after losing a CAS race
const MAX_CAS_ATTEMPTS: usize = 3;

/// Acquires, renews and releases dialog leases for one node
#[derive(Debug)]
pub struct LeaseManager {
    node_id: NodeId,
    store: Arc<CacheAdapter>,
    clock: Arc<dyn Clock>,
    locks: Arc<KeyedLocks>,
    lease_duration: Duration,
    safety_margin: Duration,
    held: DashMap<DialogKey, Lease>,
}

impl LeaseManager {
    pub fn new(
        node_id: NodeId,
        store: Arc<CacheAdapter>,
        clock: Arc<dyn Clock>,
        locks: Arc<KeyedLocks>,
        lease_duration: Duration,
        safety_margin: Duration,
    ) -> Self {
        Self {
            node_id,
            store,
            clock,
            locks,
            lease_duration,
            safety_margin,
            held: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Claim the dialog for this node
    ///
    /// Succeeds when no live lease exists or the live lease is already ours.
    /// Fails with `OwnershipConflict` when another node holds a live lease.
    pub async fn acquire(&self, key: &DialogKey) -> HaResult<Lease> {
        let _guard = self.locks.lock(key).await;
        self.acquire_locked(key).await
    }

    /// [`acquire`](Self::acquire) for callers already holding the key's lock
    pub(crate) async fn acquire_locked(&self, key: &DialogKey) -> HaResult<Lease> {
        let storage_key = ownership_key(key);
        let mut last_conflict = None;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let (expected, current) = self.read_record(key, &storage_key).await?;
            let now = self.clock.now_ms();
            if let Some(record) = &current {
                if record.node != self.node_id && record.is_live(now) {
                    debug!("Lease for {} held by {}", key, record.node);
                    return Err(HaError::OwnershipConflict { key: key.clone(), owner: record.node.clone() });
                }
            }

            let record = OwnershipRecord {
                node: self.node_id.clone(),
                lease_expiry_ms: now + self.lease_duration.as_millis() as i64,
                version: expected.unwrap_or(0) + 1,
            };
            match self.store.compare_and_swap(&storage_key, expected, record.encode()?, None).await {
                Ok(version) => {
                    let lease = Lease {
                        key: key.clone(),
                        node: self.node_id.clone(),
                        expires_at_ms: record.lease_expiry_ms,
                        version,
                    };
                    let previous = current.map(|r| r.node);
                    match previous {
                        Some(node) if node != self.node_id => {
                            info!("Took over lease for {} from {} (version {})", key, node, version)
                        }
                        _ => info!("Acquired lease for {} (version {})", key, version),
                    }
                    self.held.insert(key.clone(), lease.clone());
                    return Ok(lease);
                }
                Err(conflict @ HaError::VersionConflict { .. }) => {
                    debug!("Lost lease race for {}, re-reading", key);
                    last_conflict = Some(conflict);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_conflict.unwrap_or_else(|| HaError::internal(format!("lease acquisition for {} gave up", key))))
    }

    /// Extend a lease this node owns
    pub async fn renew(&self, key: &DialogKey) -> HaResult<Lease> {
        let _guard = self.locks.lock(key).await;
        let storage_key = ownership_key(key);
        let (expected, current) = self.read_record(key, &storage_key).await?;

        match current {
            Some(record) if record.node == self.node_id => {}
            _ => {
                self.held.remove(key);
                return Err(self.not_owner(key));
            }
        }

        let now = self.clock.now_ms();
        let record = OwnershipRecord {
            node: self.node_id.clone(),
            lease_expiry_ms: now + self.lease_duration.as_millis() as i64,
            version: expected.unwrap_or(0) + 1,
        };
        match self.store.compare_and_swap(&storage_key, expected, record.encode()?, None).await {
            Ok(version) => {
                let lease = Lease {
                    key: key.clone(),
                    node: self.node_id.clone(),
                    expires_at_ms: record.lease_expiry_ms,
                    version,
                };
                debug!("Renewed lease for {} until {}", key, lease.expires_at_ms);
                self.held.insert(key.clone(), lease.clone());
                Ok(lease)
            }
            Err(HaError::VersionConflict { .. }) => {
                self.held.remove(key);
                Err(self.not_owner(key))
            }
            Err(e) => Err(e),
        }
    }

    /// Give a lease up immediately
    ///
    /// Writes an already-expired record so any node can claim the dialog
    /// right away. Releasing a lease this node does not hold is a no-op.
    pub async fn release(&self, key: &DialogKey) -> HaResult<()> {
        let _guard = self.locks.lock(key).await;
        self.release_locked(key).await
    }

    /// [`release`](Self::release) for callers already holding the key's lock
    pub(crate) async fn release_locked(&self, key: &DialogKey) -> HaResult<()> {
        self.held.remove(key);
        let storage_key = ownership_key(key);
        let (expected, current) = self.read_record(key, &storage_key).await?;
        let Some(record) = current.filter(|r| r.node == self.node_id) else {
            return Ok(());
        };

        let released = OwnershipRecord {
            node: record.node,
            lease_expiry_ms: 0,
            version: expected.unwrap_or(0) + 1,
        };
        match self.store.compare_and_swap(&storage_key, expected, released.encode()?, None).await {
            Ok(_) => {
                info!("Released lease for {}", key);
                Ok(())
            }
            // Someone else already moved the record on
            Err(HaError::VersionConflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete the ownership record of a purged dialog
    pub(crate) async fn remove_record_locked(&self, key: &DialogKey) -> HaResult<()> {
        self.held.remove(key);
        self.store.remove(&ownership_key(key)).await
    }

    /// Whether this node holds a lease for `key` that is valid with margin
    pub fn holds_valid_lease(&self, key: &DialogKey) -> bool {
        let deadline = self.clock.now_ms() + self.safety_margin.as_millis() as i64;
        self.held
            .get(key)
            .map_or(false, |lease| lease.expires_at_ms > deadline)
    }

    /// Fail with `NotOwner` unless this node holds a valid lease
    pub fn ensure_owner(&self, key: &DialogKey) -> HaResult<()> {
        if self.holds_valid_lease(key) {
            Ok(())
        } else {
            Err(self.not_owner(key))
        }
    }

    /// Make sure this node may act authoritatively for `key`
    ///
    /// Uses the held lease when it is still valid, otherwise tries to acquire
    /// one. Losing to another node surfaces as `NotOwner`.
    pub async fn authorize(&self, key: &DialogKey) -> HaResult<Lease> {
        if self.holds_valid_lease(key) {
            if let Some(lease) = self.held_lease(key) {
                return Ok(lease);
            }
        }
        match self.acquire(key).await {
            Ok(lease) => Ok(lease),
            Err(HaError::OwnershipConflict { .. }) | Err(HaError::VersionConflict { .. }) => {
                Err(self.not_owner(key))
            }
            Err(e) => Err(e),
        }
    }

    /// Live ownership record for `key`, if any
    pub async fn current_owner(&self, key: &DialogKey) -> HaResult<Option<OwnershipRecord>> {
        let now = self.clock.now_ms();
        Ok(self.ownership_record(key).await?.filter(|record| record.is_live(now)))
    }

    /// Stored ownership record for `key`, expired or not
    pub async fn ownership_record(&self, key: &DialogKey) -> HaResult<Option<OwnershipRecord>> {
        let storage_key = ownership_key(key);
        Ok(self.read_record(key, &storage_key).await?.1)
    }

    /// Renew every held lease that is past half of its lifetime
    ///
    /// Returns the keys this node turned out to have lost. A lease that cannot
    /// be renewed because the backend is down is kept until it expires.
    pub async fn renew_all(&self) -> Vec<DialogKey> {
        let now = self.clock.now_ms();
        let half = (self.lease_duration.as_millis() / 2) as i64;
        let due: Vec<DialogKey> = self
            .held
            .iter()
            .filter(|lease| lease.expires_at_ms - now <= half)
            .map(|lease| lease.key.clone())
            .collect();

        let mut lost = Vec::new();
        for key in due {
            match self.renew(&key).await {
                Ok(_) => {}
                Err(HaError::NotOwner { .. }) => {
                    warn!("Lost lease for {}", key);
                    lost.push(key);
                }
                Err(e) => {
                    if self.holds_valid_lease(&key) {
                        debug!("Could not renew lease for {} yet: {}", key, e);
                    } else {
                        warn!("Lease for {} ran out while the backend was unavailable: {}", key, e);
                        self.held.remove(&key);
                        lost.push(key);
                    }
                }
            }
        }
        lost
    }

    /// Release every held lease, for graceful shutdown
    pub async fn release_all(&self) -> usize {
        let keys = self.held_keys();
        let mut released = 0;
        for key in keys {
            match self.release(&key).await {
                Ok(()) => released += 1,
                Err(e) => warn!("Failed to release lease for {}: {}", key, e),
            }
        }
        released
    }

    /// Drop the local memory of a lease without touching the cache
    pub fn forget(&self, key: &DialogKey) {
        self.held.remove(key);
    }

    pub fn held_keys(&self) -> Vec<DialogKey> {
        self.held.iter().map(|lease| lease.key.clone()).collect()
    }

    pub fn held_lease(&self, key: &DialogKey) -> Option<Lease> {
        self.held.get(key).map(|lease| lease.clone())
    }

    /// Read the ownership record; an undecodable record counts as unclaimed
    async fn read_record(
        &self,
        key: &DialogKey,
        storage_key: &str,
    ) -> HaResult<(Option<u64>, Option<OwnershipRecord>)> {
        match self.store.get(storage_key).await? {
            None => Ok((None, None)),
            Some(entry) => match OwnershipRecord::decode(key, &entry.value) {
                Ok(record) => Ok((Some(entry.version), Some(record))),
                Err(e) => {
                    warn!("Ignoring unreadable ownership record for {}: {}", key, e);
                    Ok((Some(entry.version), None))
                }
            },
        }
    }

    fn not_owner(&self, key: &DialogKey) -> HaError {
        HaError::NotOwner { key: key.clone(), node: self.node_id.clone() }
    }
}
