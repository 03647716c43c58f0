//! Error types for dialog-ha
//!
//! This module defines the error taxonomy shared by the replication, ownership
//! and recovery layers, and the mapping from those errors to a decision at
//! the request-handling boundary.

pub mod ha_errors;
pub mod disposition;

// Re-export main error types
pub use ha_errors::{HaError, HaResult};
pub use disposition::RequestDisposition;
