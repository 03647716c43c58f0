//! Cache key layout and named application caches

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::dialog::DialogKey;
use crate::errors::{HaError, HaResult};

use super::CacheAdapter;

pub const DIALOG_STATE_PREFIX: &str = "dialog-state/";
pub const OWNERSHIP_PREFIX: &str = "ownership/";
pub const TRANSACTION_STATE_PREFIX: &str = "transaction-state/";
pub const APP_PREFIX: &str = "app/";
pub const CAS_CLAIM_PREFIX: &str = "cas-claim/";

pub fn dialog_state_key(key: &DialogKey) -> String {
    format!("{}{}", DIALOG_STATE_PREFIX, key.storage_key())
}

pub fn ownership_key(key: &DialogKey) -> String {
    format!("{}{}", OWNERSHIP_PREFIX, key.storage_key())
}

pub fn transaction_key(branch: &str) -> String {
    format!("{}{}", TRANSACTION_STATE_PREFIX, branch)
}

pub fn app_key(cache: &str, key: &str) -> String {
    format!("{}{}/{}", APP_PREFIX, cache, key)
}

/// Claim on writing `target` over `key` when compare-and-swap is emulated
pub fn cas_claim_key(key: &str, target: u64) -> String {
    format!("{}{}@{}", CAS_CLAIM_PREFIX, key, target)
}

/// A named string cache for application use, shared by the whole cluster
///
/// Applications keep cross-node bookkeeping here, such as the dialog ids a
/// notifier must find again after failover.
#[derive(Debug, Clone)]
pub struct ApplicationCache {
    name: String,
    store: Arc<CacheAdapter>,
    ttl: Option<Duration>,
}

impl ApplicationCache {
    pub fn new(name: impl Into<String>, store: Arc<CacheAdapter>) -> Self {
        Self { name: name.into(), store, ttl: None }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: &str) -> HaResult<Option<String>> {
        let storage_key = app_key(&self.name, key);
        match self.store.get(&storage_key).await? {
            Some(entry) => String::from_utf8(entry.value.to_vec())
                .map(Some)
                .map_err(|e| HaError::corrupt_snapshot(storage_key, e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, value: impl Into<String>) -> HaResult<()> {
        let value = Bytes::from(value.into());
        self.store.put(&app_key(&self.name, key), value, self.ttl).await?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> HaResult<()> {
        self.store.remove(&app_key(&self.name, key)).await
    }
}
