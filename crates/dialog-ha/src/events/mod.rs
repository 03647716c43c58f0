//! Lifecycle events raised by the SIP engine
//!
//! Replication is driven by one tagged event type consumed by a single
//! dispatcher ([`ReplicationManager::dispatch`](crate::replication::ReplicationManager::dispatch)).
//! Dialog events carry the live dialog as it was right after the mutation, so
//! the event alone is enough to build the snapshot.

use crate::dialog::{DialogKey, LiveDialog};
use crate::transaction::TransactionSnapshot;

/// Events the replication layer consumes
#[derive(Debug, Clone)]
pub enum DialogLifecycleEvent {
    /// A dialog was created by the first dialog-establishing response
    DialogCreated {
        dialog: LiveDialog,
    },

    /// A dialog was mutated (state, sequence numbers, target, subscription)
    DialogStateChanged {
        dialog: LiveDialog,
    },

    /// A dialog reached TERMINATED
    DialogTerminated {
        dialog: LiveDialog,
        reason: String,
    },

    /// A server or client transaction changed state
    TransactionStateChanged {
        transaction: TransactionSnapshot,
    },

    /// A transaction is gone
    TransactionTerminated {
        transaction: TransactionSnapshot,
    },
}

impl DialogLifecycleEvent {
    /// Dialog the event belongs to, if any
    ///
    /// Transactions outside a dialog (e.g. an out-of-dialog OPTIONS) have none.
    pub fn dialog_key(&self) -> Option<&DialogKey> {
        match self {
            DialogLifecycleEvent::DialogCreated { dialog }
            | DialogLifecycleEvent::DialogStateChanged { dialog }
            | DialogLifecycleEvent::DialogTerminated { dialog, .. } => Some(&dialog.key),
            DialogLifecycleEvent::TransactionStateChanged { transaction }
            | DialogLifecycleEvent::TransactionTerminated { transaction } => transaction.dialog.as_ref(),
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            DialogLifecycleEvent::DialogCreated { .. } => "dialog_created",
            DialogLifecycleEvent::DialogStateChanged { .. } => "dialog_state_changed",
            DialogLifecycleEvent::DialogTerminated { .. } => "dialog_terminated",
            DialogLifecycleEvent::TransactionStateChanged { .. } => "transaction_state_changed",
            DialogLifecycleEvent::TransactionTerminated { .. } => "transaction_terminated",
        }
    }
}
