//! Distributed cache access
//!
//! The cache is an external component that fails independently of the SIP
//! stack. Everything above this module sees it only through
//! [`CacheAdapter`], which bounds every call by a timeout, retries transient
//! failures, emulates compare-and-swap for backends without it and tracks
//! backend health.
//!
//! ## Layout
//!
//! | prefix | content |
//! |---|---|
//! | `dialog-state/<dialog key>` | encoded dialog snapshot |
//! | `ownership/<dialog key>` | ownership record |
//! | `transaction-state/<branch>` | encoded transaction snapshot |
//! | `app/<cache>/<key>` | named application caches |
//! | `cas-claim/<key>@<version>` | short-lived claims of emulated compare-and-swap |

pub mod backend;
pub mod memory;
pub mod health;
pub mod adapter;
pub mod namespace;

use bytes::Bytes;
use thiserror::Error;

pub use backend::CacheBackend;
pub use memory::InMemoryCache;
pub use health::{BackendHealth, BackendHealthReport};
pub use adapter::CacheAdapter;
pub use namespace::{ApplicationCache, dialog_state_key, ownership_key, transaction_key, app_key, cas_claim_key};

/// Errors reported by cache backends
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The backend could not serve the request
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A compare-and-swap lost against the stored version
    #[error("version conflict: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        expected: Option<u64>,
        actual: Option<u64>,
    },
}

pub type CacheResult<T> = Result<T, CacheError>;

/// A stored value together with its version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Bytes,
    /// Starts at 1 and grows by one on every write of the key
    pub version: u64,
}
