//! Configuration for dialog-ha
//!
//! [`HaConfig`] collects every knob of the replication and failover engine.
//! It can be built in code with the `with_*` methods or loaded from TOML.
//!
//! ```rust
//! use rvoip_dialog_ha::config::{HaConfig, ReplicationStrategy};
//! use std::time::Duration;
//!
//! let config = HaConfig::new("node-a")
//!     .with_lease_duration(Duration::from_secs(20))
//!     .with_replication_strategy(ReplicationStrategy::EarlyDialog);
//! assert!(config.validate().is_ok());
//!
//! let from_toml = HaConfig::from_toml_str(r#"
//!     node_id = "node-b"
//!     lease_duration_ms = 20000
//!     replication_strategy = "confirmed_dialog_no_application_data"
//! "#).unwrap();
//! assert_eq!(from_toml.node_id.as_str(), "node-b");
//! ```
//!
//! Durations are written in milliseconds in TOML (`*_ms` keys).

mod duration_ms;
pub mod strategy;
pub mod retry;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{HaError, HaResult};
use crate::ownership::NodeId;

pub use strategy::ReplicationStrategy;
pub use retry::RetryPolicy;

/// Configuration of one clustered node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    /// Identity of this node in ownership records
    pub node_id: NodeId,

    /// How long an acquired or renewed lease lasts
    #[serde(rename = "lease_duration_ms", with = "duration_ms")]
    pub lease_duration: Duration,

    /// How often held leases are renewed
    #[serde(rename = "lease_renew_interval_ms", with = "duration_ms")]
    pub lease_renew_interval: Duration,

    /// A lease is treated as lost this long before it actually expires
    #[serde(rename = "lease_safety_margin_ms", with = "duration_ms")]
    pub lease_safety_margin: Duration,

    /// Delay between TERMINATED and removal of the snapshot
    #[serde(rename = "termination_grace_period_ms", with = "duration_ms")]
    pub termination_grace_period: Duration,

    /// Upper bound for one cache call, retries included
    #[serde(rename = "cache_operation_timeout_ms", with = "duration_ms")]
    pub cache_operation_timeout: Duration,

    /// Which dialogs get replicated
    pub replication_strategy: ReplicationStrategy,

    /// TTL handed to the backend for snapshots, if any
    #[serde(rename = "snapshot_ttl_ms", with = "duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub snapshot_ttl: Option<Duration>,

    /// Period of the lease-renewal and resync loop
    #[serde(rename = "maintenance_interval_ms", with = "duration_ms")]
    pub maintenance_interval: Duration,

    /// Idle time after which a per-dialog event worker exits
    #[serde(rename = "event_worker_idle_timeout_ms", with = "duration_ms")]
    pub event_worker_idle_timeout: Duration,

    /// Retry policy for unavailable backends
    pub retry: RetryPolicy,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::generate(),
            lease_duration: Duration::from_secs(30),
            lease_renew_interval: Duration::from_secs(10),
            lease_safety_margin: Duration::from_secs(1),
            // 64 * T1, the RFC 3261 transaction timeout
            termination_grace_period: Duration::from_secs(32),
            cache_operation_timeout: Duration::from_secs(2),
            replication_strategy: ReplicationStrategy::default(),
            snapshot_ttl: None,
            maintenance_interval: Duration::from_secs(5),
            event_worker_idle_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl HaConfig {
    /// Default configuration for the named node
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: NodeId::new(node_id),
            ..Default::default()
        }
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(contents: &str) -> HaResult<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| HaError::config(format!("failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> HaResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| HaError::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> HaResult<String> {
        toml::to_string(self).map_err(|e| HaError::config(format!("failed to render configuration: {}", e)))
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = NodeId::new(node_id);
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    pub fn with_lease_renew_interval(mut self, interval: Duration) -> Self {
        self.lease_renew_interval = interval;
        self
    }

    pub fn with_lease_safety_margin(mut self, margin: Duration) -> Self {
        self.lease_safety_margin = margin;
        self
    }

    pub fn with_termination_grace_period(mut self, grace: Duration) -> Self {
        self.termination_grace_period = grace;
        self
    }

    pub fn with_cache_operation_timeout(mut self, timeout: Duration) -> Self {
        self.cache_operation_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_replication_strategy(mut self, strategy: ReplicationStrategy) -> Self {
        self.replication_strategy = strategy;
        self
    }

    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> Self {
        self.snapshot_ttl = Some(ttl);
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn with_event_worker_idle_timeout(mut self, timeout: Duration) -> Self {
        self.event_worker_idle_timeout = timeout;
        self
    }

    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> HaResult<()> {
        if self.node_id.as_str().is_empty() {
            return Err(HaError::config("node_id must not be empty"));
        }
        if self.lease_duration.is_zero() {
            return Err(HaError::config("lease_duration must be greater than 0"));
        }
        if self.lease_safety_margin >= self.lease_duration {
            return Err(HaError::config("lease_safety_margin must be shorter than lease_duration"));
        }
        if self.lease_renew_interval.is_zero() || self.lease_renew_interval >= self.lease_duration {
            return Err(HaError::config(
                "lease_renew_interval must be greater than 0 and shorter than lease_duration",
            ));
        }
        if self.cache_operation_timeout.is_zero() {
            return Err(HaError::config("cache_operation_timeout must be greater than 0"));
        }
        if self.cache_operation_timeout >= self.lease_duration {
            return Err(HaError::config("cache_operation_timeout must be shorter than lease_duration"));
        }
        if self.maintenance_interval.is_zero() {
            return Err(HaError::config("maintenance_interval must be greater than 0"));
        }
        if matches!(self.snapshot_ttl, Some(ttl) if ttl <= self.termination_grace_period) {
            return Err(HaError::config("snapshot_ttl must exceed termination_grace_period"));
        }
        self.retry.validate()
    }
}
