//! Per-dialog async mutexes

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::dialog::DialogKey;

/// One async mutex per dialog key
///
/// Serializes lease and snapshot mutations for the same dialog while leaving
/// different dialogs fully concurrent. The table only grows while keys are in
/// use; [`forget`](Self::forget) drops idle entries.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<DialogKey, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &DialogKey) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop the mutex for `key` if nobody holds or waits on it
    pub fn forget(&self, key: &DialogKey) {
        self.locks.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }
}
