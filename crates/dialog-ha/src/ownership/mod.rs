//! Dialog ownership
//!
//! At most one node is authoritative for a dialog at any instant. Authority
//! is a time-bounded lease recorded in the shared cache; a node must hold it
//! before it mutates replicated state or sends a final response for the
//! dialog.

pub mod record;
pub mod clock;
pub mod locks;
pub mod lease_manager;

pub use record::{NodeId, OwnershipRecord, Lease};
pub use clock::{Clock, SystemClock, ManualClock};
pub use locks::KeyedLocks;
pub use lease_manager::LeaseManager;
