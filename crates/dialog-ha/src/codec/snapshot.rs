//! The replicable dialog snapshot

use std::collections::BTreeMap;

use crate::dialog::{DialogKey, DialogState, SubscriptionState};

/// Current snapshot format revision
pub const SNAPSHOT_FORMAT: u32 = 1;

/// Immutable replicable state of one dialog
///
/// Holds identifiers and plain values only; URIs are kept in their string
/// form and re-validated when the snapshot is bound on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogSnapshot {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
    pub state: DialogState,
    pub local_seq: u32,
    pub remote_seq: u32,
    /// Route entries, in traversal order
    pub route_set: Vec<String>,
    pub local_uri: String,
    pub remote_uri: String,
    pub remote_target: String,
    pub is_initiator: bool,
    pub subscription_state: SubscriptionState,
    pub application_data: BTreeMap<String, String>,
    /// Persisted version; assigned by the replication manager on write
    pub version: u64,
}

impl DialogSnapshot {
    pub fn key(&self) -> DialogKey {
        DialogKey::new(self.call_id.clone(), self.local_tag.clone(), self.remote_tag.clone())
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminal()
    }
}
