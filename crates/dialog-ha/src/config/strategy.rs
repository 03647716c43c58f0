//! Which dialogs are worth replicating

use serde::{Deserialize, Serialize};

use crate::dialog::DialogState;

/// Replication strategy of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStrategy {
    /// Replicate dialogs once confirmed, and their termination
    #[default]
    ConfirmedDialog,
    /// As `ConfirmedDialog`, with application data stripped from snapshots
    ConfirmedDialogNoApplicationData,
    /// Replicate from the first early state on
    EarlyDialog,
}

impl ReplicationStrategy {
    /// Whether a snapshot in `state` should be written
    ///
    /// `already_replicated` is true when an earlier snapshot of the dialog is
    /// in the cache; its termination must then be written too.
    pub fn admits(&self, state: DialogState, already_replicated: bool) -> bool {
        match (self, state) {
            (ReplicationStrategy::EarlyDialog, _) => true,
            (_, DialogState::Early) => false,
            (_, DialogState::Confirmed) => true,
            (_, DialogState::Terminated) => already_replicated,
        }
    }

    /// Whether application data goes into snapshots
    pub fn replicates_application_data(&self) -> bool {
        !matches!(self, ReplicationStrategy::ConfirmedDialogNoApplicationData)
    }
}
