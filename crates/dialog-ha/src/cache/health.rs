//! Backend health tracking

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{info, warn};

/// Health of the cache backend as seen by one node
///
/// The backend is degraded from the first failed call until the next
/// successful one. Transitions are logged once each way.
#[derive(Debug, Default)]
pub struct BackendHealth {
    degraded: AtomicBool,
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
    last_error: RwLock<Option<String>>,
}

/// Point-in-time copy of [`BackendHealth`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackendHealthReport {
    pub degraded: bool,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_error: Option<String>,
}

impl BackendHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!("Cache backend recovered");
        }
    }

    pub fn record_failure(&self, operation: &str, message: &str) {
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some(format!("{}: {}", operation, message));
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                operation,
                consecutive_failures = consecutive,
                "Cache backend degraded: {}",
                message
            );
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> BackendHealthReport {
        BackendHealthReport {
            degraded: self.is_degraded(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
        }
    }
}
