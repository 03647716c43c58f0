//! Node identity and the replicated ownership record

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dialog::DialogKey;
use crate::errors::{HaError, HaResult};

/// Identifier of a cluster node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random node id, used when configuration does not name the node
    pub fn generate() -> Self {
        Self(format!("node-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Who owns a dialog, and until when
///
/// Stored under `ownership/<dialog key>`. A record whose expiry has passed is
/// equivalent to no record at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipRecord {
    pub node: NodeId,
    /// Lease expiry, epoch milliseconds
    pub lease_expiry_ms: i64,
    pub version: u64,
}

impl OwnershipRecord {
    /// Whether the lease is still running at `now_ms`
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.lease_expiry_ms > now_ms
    }

    pub(crate) fn encode(&self) -> HaResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| HaError::internal(format!("failed to encode ownership record: {}", e)))
    }

    pub(crate) fn decode(key: &DialogKey, bytes: &[u8]) -> HaResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            HaError::corrupt_snapshot(format!("ownership/{}", key), format!("bad ownership record: {}", e))
        })
    }
}

/// A lease this node holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: DialogKey,
    pub node: NodeId,
    pub expires_at_ms: i64,
    /// Cache version of the ownership record backing the lease
    pub version: u64,
}
