//! The SIP engine seam
//!
//! dialog-ha does not run transactions or own sockets. It talks to the SIP
//! stack through [`SipEngine`], and binds recovered dialogs to the node they
//! land on through an explicit [`TransportContext`].

use async_trait::async_trait;

use crate::codec::DialogSnapshot;
use crate::dialog::DialogKey;
use crate::errors::HaResult;
use crate::message::{SipRequest, SipResponse, SipUri};
use crate::ownership::NodeId;

/// Per-node transport binding for dialogs
///
/// Never replicated: every node binds recovered dialogs to its own context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportContext {
    pub node_id: NodeId,
    /// Address this node listens on
    pub local_address: SipUri,
    pub transport: String,
}

impl TransportContext {
    pub fn new(node_id: NodeId, local_address: SipUri) -> Self {
        Self {
            node_id,
            local_address,
            transport: "UDP".to_string(),
        }
    }

    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = transport.into();
        self
    }

    /// Contact URI for messages this node sends
    pub fn contact(&self) -> SipUri {
        self.local_address.clone()
    }
}

/// Operations the HA layer needs from the SIP stack
#[async_trait]
pub trait SipEngine: Send + Sync {
    /// Whether the engine already holds the dialog
    async fn has_dialog(&self, key: &DialogKey) -> bool;

    /// Rehydrate and bind a replicated dialog
    ///
    /// Must be idempotent: returns `Ok(false)` when the dialog was already bound.
    async fn bind_recovered_dialog(&self, snapshot: &DialogSnapshot, transport: &TransportContext) -> HaResult<bool>;

    /// Bring a dialog the engine already holds up to a newer snapshot
    ///
    /// Used when this node takes a dialog back after a peer served it.
    /// Sequence numbers must never move down. Returns whether anything changed.
    async fn catch_up_dialog(&self, snapshot: &DialogSnapshot) -> HaResult<bool>;

    /// Send a request (in-dialog requests built after recovery included)
    async fn send_request(&self, request: SipRequest) -> HaResult<()>;

    /// Send a response
    async fn send_response(&self, response: SipResponse) -> HaResult<()>;
}
