//! The dialog-ha error enum
//!
//! Every variant is recoverable at the request-handling boundary. Callers turn
//! an error into a [`RequestDisposition`](super::RequestDisposition) instead of
//! aborting the process.

use thiserror::Error;

use crate::cache::CacheError;
use crate::dialog::DialogKey;
use crate::ownership::NodeId;

/// Result type used throughout dialog-ha
pub type HaResult<T> = Result<T, HaError>;

/// Errors raised by the replication and failover engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HaError {
    /// The cache backend could not be reached or did not answer in time.
    ///
    /// Transient. Never fatal to calls this node already owns.
    #[error("Cache backend unavailable during {operation}: {message}")]
    BackendUnavailable {
        /// Cache operation that failed (get, put, remove, compare_and_swap)
        operation: String,
        /// Backend-provided detail
        message: String,
    },

    /// A compare-and-swap presented a version that no longer matches.
    #[error("Version conflict on {key}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        /// Cache key the write targeted
        key: String,
        /// Version the writer expected
        expected: Option<u64>,
        /// Version currently stored (None when the entry is absent)
        actual: Option<u64>,
    },

    /// A stored snapshot could not be decoded.
    #[error("Corrupt snapshot for {key}: {reason}")]
    CorruptSnapshot {
        /// Storage key of the snapshot
        key: String,
        /// Why decoding failed
        reason: String,
    },

    /// Neither the local table nor the cache knows the dialog.
    #[error("Unknown dialog: {key}")]
    UnknownDialog {
        /// Dialog that was looked up
        key: DialogKey,
    },

    /// Another node holds a live lease for the dialog.
    #[error("Dialog {key} is owned by node {owner}")]
    OwnershipConflict {
        /// Contended dialog
        key: DialogKey,
        /// Node currently holding the lease
        owner: NodeId,
    },

    /// A mutation or authoritative response was attempted without a lease.
    #[error("Node {node} does not hold the lease for {key}")]
    NotOwner {
        /// Dialog that was touched
        key: DialogKey,
        /// Node that attempted the operation
        node: NodeId,
    },

    /// Failover recovery could not rehydrate the dialog.
    #[error("Recovery of {key} failed: {reason}")]
    RecoveryFailed {
        /// Dialog being recovered
        key: DialogKey,
        /// Underlying cause
        reason: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// Human-readable error message
        message: String,
    },

    /// SIP-level problem detected while routing or building messages.
    #[error("SIP protocol error: {message}")]
    Protocol {
        /// Human-readable error message
        message: String,
    },

    /// A forwarded request arrived with Max-Forwards already at zero.
    #[error("Max-Forwards exhausted for {method} request")]
    TooManyHops {
        /// Method of the dropped request
        method: String,
    },

    /// Unexpected internal state.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message
        message: String,
    },
}

impl HaError {
    /// Create a backend unavailable error
    pub fn backend_unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackendUnavailable { operation: operation.into(), message: message.into() }
    }

    /// Create a corrupt snapshot error
    pub fn corrupt_snapshot(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptSnapshot { key: key.into(), reason: reason.into() }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// True for errors worth retrying later (backend outages)
    pub fn is_transient(&self) -> bool {
        matches!(self, HaError::BackendUnavailable { .. })
    }

    /// Attach a cache key to a backend-level error
    pub fn from_cache(key: &str, operation: &str, error: CacheError) -> Self {
        match error {
            CacheError::Unavailable(message) => Self::backend_unavailable(operation, message),
            CacheError::VersionConflict { expected, actual } => Self::VersionConflict {
                key: key.to_string(),
                expected,
                actual,
            },
        }
    }
}
