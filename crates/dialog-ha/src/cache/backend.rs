//! The cache backend contract

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{CacheEntry, CacheResult};

/// A key/value store with versioned writes
///
/// Keys are flat strings and values opaque bytes. Every successful write of a
/// key yields a version one higher than the one it replaced.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>>;

    /// Unconditional write; returns the new version
    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> CacheResult<u64>;

    async fn remove(&self, key: &str) -> CacheResult<()>;

    /// Write only if the stored version equals `expected` (`None` = absent)
    ///
    /// Returns the new version, or `VersionConflict` with the version found.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> CacheResult<u64>;

    /// Whether `compare_and_swap` is implemented natively
    fn supports_compare_and_swap(&self) -> bool {
        true
    }
}
