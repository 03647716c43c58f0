//! Replicated transaction state
//!
//! Only the identity and coarse state of a transaction is replicated. The
//! retransmission timers stay with the node running the transaction.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dialog::DialogKey;
use crate::message::Method;

/// Transaction state as defined by RFC 3261 section 17
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Trying,
    Proceeding,
    Completed,
    /// INVITE server transaction after the ACK for a non-2xx final response
    Confirmed,
    Terminated,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Trying => "TRYING",
            TransactionState::Proceeding => "PROCEEDING",
            TransactionState::Completed => "COMPLETED",
            TransactionState::Confirmed => "CONFIRMED",
            TransactionState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replicable view of one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSnapshot {
    /// Via branch identifying the transaction
    pub branch: String,
    pub method: String,
    pub state: TransactionState,
    /// Dialog the transaction runs in, if any
    #[serde(default)]
    pub dialog: Option<DialogKey>,
}

impl TransactionSnapshot {
    pub fn new(branch: impl Into<String>, method: &Method, state: TransactionState) -> Self {
        Self {
            branch: branch.into(),
            method: method.as_str().to_string(),
            state,
            dialog: None,
        }
    }

    pub fn in_dialog(mut self, key: DialogKey) -> Self {
        self.dialog = Some(key);
        self
    }

    pub fn with_state(mut self, state: TransactionState) -> Self {
        self.state = state;
        self
    }
}
