//! In-process cache backend
//!
//! A `DashMap`-backed [`CacheBackend`] used by single-process clusters and
//! tests. It supports TTLs and can inject faults: the backend can be switched
//! offline, every call can be delayed, and native compare-and-swap can be
//! turned off so callers exercise their emulation path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::trace;

use super::{CacheBackend, CacheEntry, CacheError, CacheResult};

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    version: u64,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Shared in-memory cache
#[derive(Debug)]
pub struct InMemoryCache {
    name: String,
    entries: DashMap<String, StoredValue>,
    available: AtomicBool,
    latency: RwLock<Option<Duration>>,
    native_cas: bool,
    operations: AtomicU64,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::named("in-memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            latency: RwLock::new(None),
            native_cas: true,
            operations: AtomicU64::new(0),
        }
    }

    /// Report no native compare-and-swap support
    pub fn without_compare_and_swap(mut self) -> Self {
        self.native_cas = false;
        self
    }

    /// Take the backend on- or offline
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().is_live(now)).count()
    }

    /// Live keys under `prefix`
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.value().is_live(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Calls served or refused so far
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    async fn admit(&self, operation: &str) -> CacheResult<()> {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable(format!("{} is offline ({})", self.name, operation)));
        }
        Ok(())
    }

    fn expiry(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|ttl| Instant::now() + ttl)
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        self.admit("get").await?;
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            None => return Ok(None),
            Some(stored) if stored.is_live(now) => {
                return Ok(Some(CacheEntry { value: stored.value.clone(), version: stored.version }));
            }
            Some(_) => true,
        };
        if expired {
            trace!("Expired entry {}", key);
            self.entries.remove_if(key, |_, stored| !stored.is_live(now));
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> CacheResult<u64> {
        self.admit("put").await?;
        let now = Instant::now();
        let expires_at = Self::expiry(ttl);
        let version = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let version = if slot.get().is_live(now) { slot.get().version + 1 } else { 1 };
                slot.insert(StoredValue { value, version, expires_at });
                version
            }
            Entry::Vacant(slot) => {
                slot.insert(StoredValue { value, version: 1, expires_at });
                1
            }
        };
        Ok(version)
    }

    async fn remove(&self, key: &str) -> CacheResult<()> {
        self.admit("remove").await?;
        self.entries.remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> CacheResult<u64> {
        self.admit("compare_and_swap").await?;
        if !self.native_cas {
            return Err(CacheError::Unavailable(format!(
                "{} does not support compare-and-swap",
                self.name
            )));
        }
        let now = Instant::now();
        let expires_at = Self::expiry(ttl);
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let actual = Some(slot.get().version).filter(|_| slot.get().is_live(now));
                if actual != expected {
                    return Err(CacheError::VersionConflict { expected, actual });
                }
                let version = actual.unwrap_or(0) + 1;
                slot.insert(StoredValue { value, version, expires_at });
                Ok(version)
            }
            Entry::Vacant(slot) => {
                if expected.is_some() {
                    return Err(CacheError::VersionConflict { expected, actual: None });
                }
                slot.insert(StoredValue { value, version: 1, expires_at });
                Ok(1)
            }
        }
    }

    fn supports_compare_and_swap(&self) -> bool {
        self.native_cas
    }
}
