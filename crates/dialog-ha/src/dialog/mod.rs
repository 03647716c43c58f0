//! Core dialog types and the local dialog table
//!
//! - [`DialogKey`]: Call-ID plus local and remote tag, the cluster-wide identity of a dialog
//! - [`DialogState`] / [`SubscriptionState`]: replicated lifecycle states
//! - [`LiveDialog`]: the mutable dialog a node works with while it owns the call
//! - [`DialogTable`]: the single authoritative table live dialogs are looked up in
//!
//! ## Dialog Lifecycle
//!
//! ```text
//! Early ──→ Confirmed ──→ Terminated
//!   │                         ↑
//!   └─────────────────────────┘
//!  18x       2xx            BYE / CANCEL
//! ```
//!
//! Confirmed and Terminated never go back to Early, and Terminated is absorbing.

pub mod dialog_key;
pub mod dialog_state;
pub mod live_dialog;
pub mod dialog_table;

pub use dialog_key::DialogKey;
pub use dialog_state::{DialogState, SubscriptionState};
pub use live_dialog::{LiveDialog, Attachments};
pub use dialog_table::DialogTable;
