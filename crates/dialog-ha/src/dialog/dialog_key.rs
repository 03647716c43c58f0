//! Dialog identity

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::SipRequest;

/// Identifies one dialog across the cluster: Call-ID, local tag, remote tag
///
/// "Local" is the side of the clustered nodes, so every node that may own the
/// dialog derives the same key from the same message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DialogKey {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogKey {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// Key of the dialog a received request belongs to (we are the UAS)
    ///
    /// Returns `None` until both tags are known.
    pub fn from_uas_request(request: &SipRequest) -> Option<Self> {
        Some(Self::new(
            request.call_id.clone(),
            request.to.tag.clone()?,
            request.from.tag.clone()?,
        ))
    }

    /// Key of the dialog a request we sent belongs to (we are the UAC)
    pub fn from_uac_request(request: &SipRequest) -> Option<Self> {
        Some(Self::new(
            request.call_id.clone(),
            request.from.tag.clone()?,
            request.to.tag.clone()?,
        ))
    }

    /// Flat string form used in cache keys
    pub fn storage_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DialogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{}", self.call_id, self.local_tag, self.remote_tag)
    }
}
