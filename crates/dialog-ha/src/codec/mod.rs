//! State codec: live dialogs and transactions to and from cache bytes
//!
//! Encoding a live dialog is total. Node-local parts are dropped: the bound
//! transport context silently, application attachments with a warning.
//! Decoding is strict and never trusts the bytes: missing identity fields,
//! unknown states, unknown format revisions and identity mismatches all fail
//! with `CorruptSnapshot`, scoped to the one key being read.
//!
//! The wire format is camelCase JSON:
//!
//! ```json
//! {"format":1,"callId":"c1","localTag":"4321","remoteTag":"12345",
//!  "state":"CONFIRMED","localSeq":1,"remoteSeq":1,
//!  "routeSet":["sip:127.0.0.1:5050;lr"], "...": "..."}
//! ```

pub mod snapshot;

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::ReplicationStrategy;
use crate::dialog::{DialogKey, DialogState, LiveDialog, SubscriptionState};
use crate::errors::{HaError, HaResult};
use crate::transaction::TransactionSnapshot;

pub use snapshot::{DialogSnapshot, SNAPSHOT_FORMAT};

/// On-the-wire form; every field optional so decoding can say what is missing
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDialog {
    format: Option<u32>,
    call_id: Option<String>,
    local_tag: Option<String>,
    remote_tag: Option<String>,
    state: Option<String>,
    #[serde(default)]
    local_seq: u32,
    #[serde(default)]
    remote_seq: u32,
    #[serde(default)]
    route_set: Vec<String>,
    #[serde(default)]
    local_uri: String,
    #[serde(default)]
    remote_uri: String,
    #[serde(default)]
    remote_target: String,
    #[serde(default)]
    is_initiator: bool,
    subscription_state: Option<String>,
    #[serde(default)]
    application_data: BTreeMap<String, String>,
    #[serde(default)]
    version: u64,
}

/// Encodes and decodes snapshots for one replication strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotCodec {
    strategy: ReplicationStrategy,
}

impl SnapshotCodec {
    pub fn new(strategy: ReplicationStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ReplicationStrategy {
        self.strategy
    }

    /// Snapshot a live dialog
    pub fn snapshot(&self, dialog: &LiveDialog) -> DialogSnapshot {
        if !dialog.attachments.is_empty() {
            warn!(
                "Dropping {} non-replicable attachment(s) of dialog {}: {:?}",
                dialog.attachments.len(),
                dialog.key,
                dialog.attachments.names().collect::<Vec<_>>()
            );
        }
        let application_data = if self.strategy.replicates_application_data() {
            dialog.application_data.clone()
        } else {
            BTreeMap::new()
        };

        DialogSnapshot {
            call_id: dialog.key.call_id.clone(),
            local_tag: dialog.key.local_tag.clone(),
            remote_tag: dialog.key.remote_tag.clone(),
            state: dialog.state,
            local_seq: dialog.local_seq,
            remote_seq: dialog.remote_seq,
            route_set: dialog.route_set.iter().map(ToString::to_string).collect(),
            local_uri: dialog.local_uri.to_string(),
            remote_uri: dialog.remote_uri.to_string(),
            remote_target: dialog.remote_target.to_string(),
            is_initiator: dialog.is_initiator,
            subscription_state: dialog.subscription_state,
            application_data,
            version: 0,
        }
    }

    /// Serialize a snapshot
    pub fn encode(&self, snapshot: &DialogSnapshot) -> HaResult<Bytes> {
        let wire = WireDialog {
            format: Some(SNAPSHOT_FORMAT),
            call_id: Some(snapshot.call_id.clone()),
            local_tag: Some(snapshot.local_tag.clone()),
            remote_tag: Some(snapshot.remote_tag.clone()),
            state: Some(snapshot.state.as_str().to_string()),
            local_seq: snapshot.local_seq,
            remote_seq: snapshot.remote_seq,
            route_set: snapshot.route_set.clone(),
            local_uri: snapshot.local_uri.clone(),
            remote_uri: snapshot.remote_uri.clone(),
            remote_target: snapshot.remote_target.clone(),
            is_initiator: snapshot.is_initiator,
            subscription_state: Some(snapshot.subscription_state.as_str().to_string()),
            application_data: snapshot.application_data.clone(),
            version: snapshot.version,
        };
        serde_json::to_vec(&wire)
            .map(Bytes::from)
            .map_err(|e| HaError::internal(format!("failed to encode snapshot of {}: {}", snapshot.key(), e)))
    }

    /// Deserialize and validate the snapshot stored for `expected`
    pub fn decode(&self, expected: &DialogKey, bytes: &[u8]) -> HaResult<DialogSnapshot> {
        let result = self.decode_inner(expected, bytes);
        if let Err(e) = &result {
            error!("{}", e);
        }
        result
    }

    fn decode_inner(&self, expected: &DialogKey, bytes: &[u8]) -> HaResult<DialogSnapshot> {
        let corrupt = |reason: String| HaError::corrupt_snapshot(expected.storage_key(), reason);

        let wire: WireDialog =
            serde_json::from_slice(bytes).map_err(|e| corrupt(format!("not a snapshot: {}", e)))?;

        match wire.format {
            Some(SNAPSHOT_FORMAT) => {}
            Some(other) => return Err(corrupt(format!("unknown format revision {}", other))),
            None => return Err(corrupt("missing format revision".to_string())),
        }
        let call_id = wire.call_id.ok_or_else(|| corrupt("missing callId".to_string()))?;
        let local_tag = wire.local_tag.ok_or_else(|| corrupt("missing localTag".to_string()))?;
        let remote_tag = wire.remote_tag.ok_or_else(|| corrupt("missing remoteTag".to_string()))?;
        let state: DialogState = wire
            .state
            .ok_or_else(|| corrupt("missing state".to_string()))?
            .parse()
            .map_err(corrupt)?;
        let subscription_state: SubscriptionState = match wire.subscription_state {
            Some(value) => value.parse().map_err(corrupt)?,
            None => SubscriptionState::None,
        };

        let snapshot = DialogSnapshot {
            call_id,
            local_tag,
            remote_tag,
            state,
            local_seq: wire.local_seq,
            remote_seq: wire.remote_seq,
            route_set: wire.route_set,
            local_uri: wire.local_uri,
            remote_uri: wire.remote_uri,
            remote_target: wire.remote_target,
            is_initiator: wire.is_initiator,
            subscription_state,
            application_data: wire.application_data,
            version: wire.version,
        };
        if snapshot.key() != *expected {
            return Err(corrupt(format!("snapshot belongs to {}", snapshot.key())));
        }
        Ok(snapshot)
    }

    pub fn encode_transaction(&self, transaction: &TransactionSnapshot) -> HaResult<Bytes> {
        serde_json::to_vec(transaction).map(Bytes::from).map_err(|e| {
            HaError::internal(format!("failed to encode transaction {}: {}", transaction.branch, e))
        })
    }

    pub fn decode_transaction(&self, branch: &str, bytes: &[u8]) -> HaResult<TransactionSnapshot> {
        let transaction: TransactionSnapshot = serde_json::from_slice(bytes)
            .map_err(|e| HaError::corrupt_snapshot(format!("transaction-state/{}", branch), e.to_string()))?;
        if transaction.branch != branch {
            return Err(HaError::corrupt_snapshot(
                format!("transaction-state/{}", branch),
                format!("snapshot belongs to branch {}", transaction.branch),
            ));
        }
        Ok(transaction)
    }
}
