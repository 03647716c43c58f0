//! Dialog and transaction replication
//!
//! The [`ReplicationManager`] is the single consumer of
//! [`DialogLifecycleEvent`](crate::events::DialogLifecycleEvent)s. It turns
//! them into versioned snapshot writes, resolves conflicting writers, and
//! removes terminated dialogs from the cache after a grace period.

pub mod manager;
pub mod stats;

pub use manager::{ReplicationManager, ReplicationOutcome};
pub use stats::{ReplicationStats, ReplicationStatsSnapshot};

#[cfg(test)]
mod tests;
