//! # Dialog-HA - Replicated SIP dialogs for RVoIP clusters
//!
//! This crate keeps SIP dialog and transaction state replicated across the
//! nodes of a cluster through a pluggable distributed cache, so that when the
//! node owning a call fails a peer can recover the call and keep answering
//! in-dialog requests (BYE, NOTIFY, CANCEL) correctly.
//!
//! ## Architecture
//!
//! ```text
//! SIP engine ──DialogLifecycleEvent──→ ClusteredDialogManager
//!                                         │ per-dialog ordered workers
//!                                         ▼
//!                                  ReplicationManager ──→ SnapshotCodec ──→ CacheAdapter ──→ cache
//!                                         │
//!                                   LeaseManager (ownership/<key>, CAS)
//!
//! in-dialog request, dialog unknown locally
//!   → FailoverRecoveryManager: get → decode → acquire lease → bind to engine
//! ```
//!
//! - [`dialog`]: dialog identity, state machine and the local dialog table
//! - [`codec`]: immutable snapshots and their serialized form
//! - [`cache`]: the backend trait, an in-memory backend and the
//!   timeout/retry/health adapter every other module goes through
//! - [`ownership`]: leases deciding which node is authoritative for a dialog
//! - [`replication`]: write-through of lifecycle events with conflict handling
//! - [`recovery`]: rehydration of a dialog on a surviving node
//! - [`router`]: the stateless forwarder in front of the cluster
//! - [`manager`]: the facade tying it together for one node
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_dialog_ha::prelude::*;
//!
//! # async fn run(engine: Arc<dyn SipEngine>) -> HaResult<()> {
//! let config = HaConfig::from_file("node-a.toml")?;
//! let transport = TransportContext::new(config.node_id.clone(), "sip:10.0.0.1:5070".parse()?);
//! let manager = ClusteredDialogManager::new(
//!     config,
//!     Arc::new(InMemoryCache::new()),
//!     engine,
//!     Arc::new(SystemClock),
//!     transport,
//! )?;
//! manager.start();
//!
//! # let key = DialogKey::new("call", "local", "remote");
//! match manager.resolve_in_dialog(&key).await {
//!     RequestDisposition::Proceed => { /* handle locally */ }
//!     RequestDisposition::Forward { owner } => { /* relay to `owner` */ }
//!     RequestDisposition::Reject { status, .. } => { /* answer with `status` */ }
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod dialog;
pub mod engine;
pub mod errors;
pub mod events;
pub mod logging;
pub mod manager;
pub mod message;
pub mod ownership;
pub mod recovery;
pub mod replication;
pub mod router;
pub mod scheduler;
pub mod transaction;

// Re-export main types
pub use errors::{HaError, HaResult, RequestDisposition};
pub use manager::ClusteredDialogManager;

/// Everything a clustered node usually needs
pub mod prelude {
    pub use crate::cache::{ApplicationCache, CacheBackend, InMemoryCache};
    pub use crate::config::{HaConfig, ReplicationStrategy, RetryPolicy};
    pub use crate::dialog::{DialogKey, DialogState, DialogTable, LiveDialog, SubscriptionState};
    pub use crate::engine::{SipEngine, TransportContext};
    pub use crate::errors::{HaError, HaResult, RequestDisposition};
    pub use crate::events::DialogLifecycleEvent;
    pub use crate::manager::ClusteredDialogManager;
    pub use crate::ownership::{Clock, NodeId, SystemClock};
    pub use crate::router::{ClusterMember, StatelessForwarder};
}
