//! Failover recovery
//!
//! When an in-dialog request reaches a node that does not know the dialog,
//! the [`FailoverRecoveryManager`] pulls the replicated snapshot out of the
//! cache, takes the lease over, and binds the dialog to the local engine.

pub mod recovery_manager;

pub use recovery_manager::{FailoverRecoveryManager, RecoveryOutcome};
