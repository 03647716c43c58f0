//! Authoritative local dialog table
//!
//! Every live dialog a node handles sits in one [`DialogTable`], indexed by
//! [`DialogKey`]. Mutations go through the table so that each one raises the
//! matching [`DialogLifecycleEvent`] for the replication layer. Events are
//! sent while the entry is still locked, which keeps them in mutation order
//! per dialog.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::codec::DialogSnapshot;
use crate::engine::TransportContext;
use crate::errors::{HaError, HaResult};
use crate::events::DialogLifecycleEvent;
use crate::message::{Method, SipRequest, SipResponse};

use super::{DialogKey, DialogState, LiveDialog};

/// Local dialog storage plus lifecycle event emission
#[derive(Debug, Clone)]
pub struct DialogTable {
    dialogs: Arc<DashMap<DialogKey, LiveDialog>>,
    transport: TransportContext,
    event_sender: Option<mpsc::UnboundedSender<DialogLifecycleEvent>>,
}

impl DialogTable {
    /// Create a table whose dialogs are bound to `transport`
    pub fn new(transport: TransportContext) -> Self {
        Self {
            dialogs: Arc::new(DashMap::new()),
            transport,
            event_sender: None,
        }
    }

    /// Raise lifecycle events on `sender`
    pub fn with_event_sender(mut self, sender: mpsc::UnboundedSender<DialogLifecycleEvent>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    pub fn transport(&self) -> &TransportContext {
        &self.transport
    }

    /// Create the UAS side of a dialog and raise `DialogCreated`
    pub fn create_uas_dialog(
        &self,
        request: &SipRequest,
        local_tag: impl Into<String>,
        state: DialogState,
    ) -> HaResult<DialogKey> {
        let mut dialog = LiveDialog::new_uas(request, local_tag, state)?;
        dialog.bind(self.transport.clone());
        self.insert(dialog)
    }

    /// Create the UAC side of a dialog from the response that established it
    pub fn create_uac_dialog(&self, request: &SipRequest, response: &SipResponse) -> HaResult<DialogKey> {
        let mut dialog = LiveDialog::new_uac(request, response)?;
        dialog.bind(self.transport.clone());
        self.insert(dialog)
    }

    /// Insert a new dialog and raise `DialogCreated`
    pub fn insert(&self, dialog: LiveDialog) -> HaResult<DialogKey> {
        let key = dialog.key.clone();
        match self.dialogs.entry(key.clone()) {
            Entry::Occupied(_) => Err(HaError::protocol(format!("dialog {} already exists", key))),
            Entry::Vacant(slot) => {
                debug!("Created dialog {} in state {}", key, dialog.state);
                let event = DialogLifecycleEvent::DialogCreated { dialog: dialog.clone() };
                let _guard = slot.insert(dialog);
                self.emit(event);
                Ok(key)
            }
        }
    }

    pub fn contains(&self, key: &DialogKey) -> bool {
        self.dialogs.contains_key(key)
    }

    /// Copy of a dialog
    pub fn get(&self, key: &DialogKey) -> Option<LiveDialog> {
        self.dialogs.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn keys(&self) -> Vec<DialogKey> {
        self.dialogs.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Dialogs sharing a Call-ID (CANCEL matching, forked calls)
    pub fn find_by_call_id(&self, call_id: &str) -> Vec<DialogKey> {
        self.dialogs
            .iter()
            .filter(|entry| entry.key().call_id == call_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Mutate a dialog and raise the matching event
    ///
    /// Raises `DialogTerminated` when the mutation ends the dialog and
    /// `DialogStateChanged` when any replicated field changed. A failing
    /// closure leaves no event behind, though its partial edits stay.
    pub fn update<R>(
        &self,
        key: &DialogKey,
        mutate: impl FnOnce(&mut LiveDialog) -> HaResult<R>,
    ) -> HaResult<R> {
        let mut entry = self
            .dialogs
            .get_mut(key)
            .ok_or_else(|| HaError::UnknownDialog { key: key.clone() })?;
        let before = entry.value().clone();
        let result = mutate(entry.value_mut())?;

        let dialog = entry.value();
        if dialog.is_terminated() && !before.is_terminated() {
            self.emit(DialogLifecycleEvent::DialogTerminated {
                dialog: dialog.clone(),
                reason: "terminated".to_string(),
            });
        } else if replicated_fields_differ(&before, dialog) {
            self.emit(DialogLifecycleEvent::DialogStateChanged { dialog: dialog.clone() });
        }
        Ok(result)
    }

    /// Build an in-dialog request, consuming a local CSeq
    pub fn create_request(&self, key: &DialogKey, method: Method) -> HaResult<SipRequest> {
        self.update(key, |dialog| {
            if dialog.is_terminated() {
                return Err(HaError::protocol(format!("dialog {} is terminated", dialog.key)));
            }
            Ok(dialog.create_request(method))
        })
    }

    /// Build a response to an in-dialog request
    pub fn create_response(&self, key: &DialogKey, request: &SipRequest, status: u16) -> HaResult<SipResponse> {
        let dialog = self
            .dialogs
            .get(key)
            .ok_or_else(|| HaError::UnknownDialog { key: key.clone() })?;
        Ok(dialog.create_response(request, status))
    }

    /// Account for an in-dialog request from the peer
    ///
    /// Validates the CSeq and applies target refresh for INVITE, SUBSCRIBE,
    /// NOTIFY and REFER.
    pub fn receive_request(&self, key: &DialogKey, request: &SipRequest) -> HaResult<()> {
        self.update(key, |dialog| {
            dialog.accept_remote_cseq(&request.method, request.cseq)?;
            if matches!(
                request.method,
                Method::Invite | Method::Subscribe | Method::Notify | Method::Refer
            ) {
                dialog.refresh_target(request.contact.as_ref());
            }
            Ok(())
        })
    }

    /// Terminate a dialog and raise `DialogTerminated`
    pub fn terminate(&self, key: &DialogKey, reason: &str) -> HaResult<()> {
        let mut entry = self
            .dialogs
            .get_mut(key)
            .ok_or_else(|| HaError::UnknownDialog { key: key.clone() })?;
        if entry.terminate() {
            debug!("Terminated dialog {}: {}", key, reason);
            self.emit(DialogLifecycleEvent::DialogTerminated {
                dialog: entry.value().clone(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    /// Bind a recovered dialog to this node
    ///
    /// Idempotent: returns `false` when the dialog is already present, in
    /// which case the existing entry is left untouched. No event is raised;
    /// the snapshot is already in the cache.
    pub fn bind_recovered(&self, snapshot: &DialogSnapshot) -> HaResult<bool> {
        match self.dialogs.entry(snapshot.key()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                let dialog = LiveDialog::from_snapshot(snapshot, &self.transport)?;
                info!(
                    "Bound recovered dialog {} ({}, local_seq={}, remote_seq={})",
                    dialog.key, dialog.state, dialog.local_seq, dialog.remote_seq
                );
                slot.insert(dialog);
                Ok(true)
            }
        }
    }

    /// Bring a held dialog up to a snapshot another node wrote
    ///
    /// No event is raised; the snapshot is already in the cache.
    pub fn catch_up(&self, snapshot: &DialogSnapshot) -> HaResult<bool> {
        let key = snapshot.key();
        let mut entry = self
            .dialogs
            .get_mut(&key)
            .ok_or_else(|| HaError::UnknownDialog { key: key.clone() })?;
        let changed = entry.catch_up(snapshot)?;
        if changed {
            info!(
                "Caught up dialog {} to {} (local_seq={}, remote_seq={})",
                key, entry.state, entry.local_seq, entry.remote_seq
            );
        }
        Ok(changed)
    }

    /// Drop a dialog from the table
    pub fn remove(&self, key: &DialogKey) -> Option<LiveDialog> {
        self.dialogs.remove(key).map(|(_, dialog)| dialog)
    }

    fn emit(&self, event: DialogLifecycleEvent) {
        if let Some(sender) = &self.event_sender {
            if sender.send(event).is_err() {
                debug!("Lifecycle event receiver dropped");
            }
        }
    }
}

fn replicated_fields_differ(before: &LiveDialog, after: &LiveDialog) -> bool {
    before.state != after.state
        || before.local_seq != after.local_seq
        || before.remote_seq != after.remote_seq
        || before.route_set != after.route_set
        || before.remote_target != after.remote_target
        || before.subscription_state != after.subscription_state
        || before.application_data != after.application_data
}
