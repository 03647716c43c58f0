//! Request-boundary decisions
//!
//! Errors from the HA layer never abort call processing. At the point where
//! an inbound request is being handled they collapse into one of three
//! decisions: carry on, forward to the owning node, or reject with a status.

use crate::ownership::NodeId;

use super::HaError;

/// What the request handler should do after an HA operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestDisposition {
    /// The dialog is available locally; process the request normally.
    Proceed,

    /// Another node owns the dialog; hand the request to it.
    Forward {
        /// Owning node
        owner: NodeId,
    },

    /// Answer the request with a final error response.
    Reject {
        /// SIP status code
        status: u16,
        /// Reason phrase
        reason: &'static str,
    },
}

impl RequestDisposition {
    /// 481 Call/Transaction Does Not Exist
    pub fn does_not_exist() -> Self {
        Self::Reject { status: 481, reason: "Call/Transaction Does Not Exist" }
    }

    /// 500 Server Internal Error
    pub fn internal_error() -> Self {
        Self::Reject { status: 500, reason: "Server Internal Error" }
    }

    /// 503 Service Unavailable
    pub fn unavailable() -> Self {
        Self::Reject { status: 503, reason: "Service Unavailable" }
    }

    /// Status code for rejections
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestDisposition::Reject { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl HaError {
    /// Map this error to the decision a request handler should take
    pub fn disposition(&self) -> RequestDisposition {
        match self {
            HaError::UnknownDialog { .. } => RequestDisposition::does_not_exist(),
            HaError::OwnershipConflict { owner, .. } => RequestDisposition::Forward { owner: owner.clone() },
            HaError::BackendUnavailable { .. } => RequestDisposition::unavailable(),
            HaError::TooManyHops { .. } => RequestDisposition::Reject { status: 483, reason: "Too Many Hops" },
            HaError::Protocol { .. } => RequestDisposition::Reject { status: 400, reason: "Bad Request" },
            HaError::NotOwner { .. }
            | HaError::VersionConflict { .. }
            | HaError::CorruptSnapshot { .. }
            | HaError::RecoveryFailed { .. }
            | HaError::Config { .. }
            | HaError::Internal { .. } => RequestDisposition::internal_error(),
        }
    }
}
