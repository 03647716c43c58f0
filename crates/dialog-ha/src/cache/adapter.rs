//! Failure-isolating front end for a cache backend
//!
//! [`CacheAdapter`] is the only way the rest of the crate touches the cache:
//!
//! - every call is bounded by one timeout covering all of its retries
//! - `Unavailable` failures are retried with exponential backoff
//! - backends without native CAS get claim-based emulation
//! - successes and failures feed [`BackendHealth`]
//!
//! Backend errors come out as [`HaError`] with the cache key attached.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::errors::{HaError, HaResult};

use super::namespace::cas_claim_key;
use super::{BackendHealth, BackendHealthReport, CacheBackend, CacheEntry, CacheError, CacheResult};

/// Timeout, retry and health tracking around a [`CacheBackend`]
#[derive(Clone)]
pub struct CacheAdapter {
    backend: Arc<dyn CacheBackend>,
    timeout: Duration,
    retry: RetryPolicy,
    health: Arc<BackendHealth>,
}

impl std::fmt::Debug for CacheAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAdapter")
            .field("backend", &self.backend.name())
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl CacheAdapter {
    pub fn new(backend: Arc<dyn CacheBackend>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            backend,
            timeout,
            retry,
            health: Arc::new(BackendHealth::new()),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn health(&self) -> BackendHealthReport {
        self.health.report()
    }

    pub fn is_degraded(&self) -> bool {
        self.health.is_degraded()
    }

    pub async fn get(&self, key: &str) -> HaResult<Option<CacheEntry>> {
        self.call("get", key, || self.backend.get(key)).await
    }

    pub async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> HaResult<u64> {
        self.call("put", key, || self.backend.put(key, value.clone(), ttl)).await
    }

    pub async fn remove(&self, key: &str) -> HaResult<()> {
        self.call("remove", key, || self.backend.remove(key)).await
    }

    /// Versioned write; `expected = None` means "only if absent"
    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> HaResult<u64> {
        if self.backend.supports_compare_and_swap() {
            return self
                .call("compare_and_swap", key, || {
                    self.backend.compare_and_swap(key, expected, value.clone(), ttl)
                })
                .await;
        }
        self.emulated_compare_and_swap(key, expected, value, ttl).await
    }

    /// CAS for backends without it
    ///
    /// Writers race for a claim on the version they want to create. Puts on
    /// the claim key are numbered by the backend, so only the first claimer
    /// sees version 1 and goes on to write; everyone else reports a conflict
    /// without touching the record. Claims expire after twice the call
    /// timeout, which bounds every racing writer.
    async fn emulated_compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> HaResult<u64> {
        let conflict = |actual: Option<u64>| HaError::VersionConflict {
            key: key.to_string(),
            expected,
            actual,
        };

        let actual = self.get(key).await?.map(|entry| entry.version);
        if actual != expected {
            return Err(conflict(actual));
        }

        let target = expected.unwrap_or(0) + 1;
        let claim = cas_claim_key(key, target);
        let claimed = self
            .put(&claim, Bytes::from_static(b"claim"), Some(self.timeout * 2))
            .await?;
        if claimed != 1 {
            debug!("Emulated CAS on {} lost the claim on version {}", key, target);
            return Err(conflict(Some(target)));
        }

        let written = self.put(key, value, ttl).await?;
        if written != target {
            // A plain put slipped in after the version check
            warn!("Emulated CAS on {} wrote version {} instead of {}", key, written, target);
            return Err(conflict(Some(written)));
        }
        Ok(written)
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, key: &str, mut attempt: F) -> HaResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let retry = &self.retry;
        let attempts = async {
            let mut attempt_no = 1;
            let mut backoff = retry.initial_backoff;
            loop {
                match attempt().await {
                    Err(CacheError::Unavailable(message)) if attempt_no < retry.max_attempts => {
                        debug!(
                            operation,
                            key,
                            attempt = attempt_no,
                            next_delay_ms = backoff.as_millis() as u64,
                            "Cache call failed, will retry: {}",
                            message
                        );
                        tokio::time::sleep(retry.jittered(backoff)).await;
                        backoff = retry.next_backoff(backoff);
                        attempt_no += 1;
                    }
                    other => return other,
                }
            }
        };

        let result = match tokio::time::timeout(self.timeout, attempts).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Unavailable(format!(
                "no answer within {}ms",
                self.timeout.as_millis()
            ))),
        };

        match result {
            Ok(value) => {
                self.health.record_success();
                Ok(value)
            }
            Err(CacheError::Unavailable(message)) => {
                warn!(operation, key, backend = self.backend.name(), "Cache call failed: {}", message);
                self.health.record_failure(operation, &message);
                Err(HaError::backend_unavailable(operation, message))
            }
            Err(conflict @ CacheError::VersionConflict { .. }) => {
                // The backend answered; a lost race says nothing about its health
                self.health.record_success();
                Err(HaError::from_cache(key, operation, conflict))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::cache::InMemoryCache;

    /// No native CAS; the first put stalls before it lands
    struct StallingBackend {
        inner: InMemoryCache,
        stall_next_put: AtomicBool,
    }

    impl StallingBackend {
        fn new() -> Self {
            Self {
                inner: InMemoryCache::new().without_compare_and_swap(),
                stall_next_put: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl CacheBackend for StallingBackend {
        fn name(&self) -> &str {
            "stalling"
        }

        async fn get(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> CacheResult<u64> {
            if self.stall_next_put.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.put(key, value, ttl).await
        }

        async fn remove(&self, key: &str) -> CacheResult<()> {
            self.inner.remove(key).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<u64>,
            value: Bytes,
            ttl: Option<Duration>,
        ) -> CacheResult<u64> {
            self.inner.compare_and_swap(key, expected, value, ttl).await
        }

        fn supports_compare_and_swap(&self) -> bool {
            false
        }
    }

    fn adapter(cache: Arc<InMemoryCache>) -> CacheAdapter {
        let retry = RetryPolicy { use_jitter: false, ..Default::default() };
        CacheAdapter::new(cache, Duration::from_millis(500), retry)
    }

    fn adapter_over(backend: Arc<StallingBackend>) -> CacheAdapter {
        CacheAdapter::new(backend, Duration::from_millis(500), RetryPolicy::none())
    }

    #[tokio::test]
    async fn test_stale_cas_surfaces_version_conflict() {
        let cache = Arc::new(InMemoryCache::new());
        let adapter = adapter(cache.clone());
        adapter.compare_and_swap("k", None, Bytes::from_static(b"1"), None).await.unwrap();
        let err = adapter
            .compare_and_swap("k", None, Bytes::from_static(b"2"), None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HaError::VersionConflict { key: "k".to_string(), expected: None, actual: Some(1) }
        );
        assert!(!adapter.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out_as_unavailable() {
        let cache = Arc::new(InMemoryCache::new());
        cache.set_latency(Some(Duration::from_secs(5)));
        let adapter = adapter(cache);

        let started = tokio::time::Instant::now();
        let err = adapter.get("k").await.unwrap_err();
        assert!(matches!(err, HaError::BackendUnavailable { .. }));
        assert!(started.elapsed() <= Duration::from_millis(600));

        let report = adapter.health();
        assert!(report.degraded);
        assert_eq!(report.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_retries_then_fails() {
        let cache = Arc::new(InMemoryCache::new());
        cache.set_available(false);
        let adapter = adapter(cache.clone());

        assert!(adapter.get("k").await.unwrap_err().is_transient());
        assert_eq!(cache.operation_count(), 3);

        cache.set_available(true);
        assert!(adapter.get("k").await.unwrap().is_none());
        assert!(!adapter.is_degraded());
    }

    #[tokio::test]
    async fn test_emulated_cas_checks_versions() {
        let cache = Arc::new(InMemoryCache::new().without_compare_and_swap());
        let adapter = adapter(cache.clone());

        assert_eq!(adapter.compare_and_swap("k", None, Bytes::from_static(b"1"), None).await.unwrap(), 1);
        assert_eq!(adapter.compare_and_swap("k", Some(1), Bytes::from_static(b"2"), None).await.unwrap(), 2);
        let err = adapter
            .compare_and_swap("k", Some(1), Bytes::from_static(b"3"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HaError::VersionConflict { actual: Some(2), .. }));
        assert_eq!(adapter.get("k").await.unwrap().unwrap().value, Bytes::from_static(b"2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emulated_cas_race_has_one_winner_and_keeps_its_value() {
        let backend = Arc::new(StallingBackend::new());
        let first = adapter_over(backend.clone());
        let second = adapter_over(backend.clone());

        let (a, b) = tokio::join!(
            first.compare_and_swap("ownership/k", None, Bytes::from_static(b"node-a"), None),
            second.compare_and_swap("ownership/k", None, Bytes::from_static(b"node-b"), None),
        );

        // node-a stalls on its claim, so node-b wins
        assert!(matches!(a, Err(HaError::VersionConflict { expected: None, .. })));
        assert_eq!(b.unwrap(), 1);
        let stored = backend.get("ownership/k").await.unwrap().unwrap();
        assert_eq!(stored.value, Bytes::from_static(b"node-b"));
        assert_eq!(stored.version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emulated_cas_claims_expire() {
        let cache = Arc::new(InMemoryCache::new().without_compare_and_swap());
        let adapter = adapter(cache.clone());

        adapter.compare_and_swap("k", None, Bytes::from_static(b"1"), None).await.unwrap();
        adapter.remove("k").await.unwrap();
        assert_eq!(cache.keys_with_prefix("cas-claim/").len(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.keys_with_prefix("cas-claim/").is_empty());
        assert_eq!(adapter.compare_and_swap("k", None, Bytes::from_static(b"again"), None).await.unwrap(), 1);
    }
}
