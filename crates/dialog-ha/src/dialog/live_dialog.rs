//! The live dialog a node works with while it owns a call
//!
//! A [`LiveDialog`] carries everything RFC 3261 section 12 asks a UA to keep
//! (sequence numbers, route set, remote target, party URIs) plus the parts
//! that only make sense on the node that holds it: application attachments
//! holding live handles and the transport context the dialog is bound to.
//! Only the former is replicated, through [`DialogSnapshot`].

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::codec::DialogSnapshot;
use crate::engine::TransportContext;
use crate::errors::{HaError, HaResult};
use crate::message::{Method, NameAddr, SipRequest, SipResponse, SipUri};

use super::{DialogKey, DialogState, SubscriptionState};

/// Node-local application objects attached to a dialog
///
/// These never leave the node; the codec drops them with a warning.
#[derive(Clone, Default)]
pub struct Attachments(HashMap<String, Arc<dyn Any + Send + Sync>>);

impl Attachments {
    pub fn insert(&mut self, name: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for Attachments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// A dialog held by this node
#[derive(Debug, Clone)]
pub struct LiveDialog {
    pub key: DialogKey,
    pub state: DialogState,

    /// Last CSeq we used in a request
    pub local_seq: u32,
    /// Last CSeq the peer used (0 until the first request arrives)
    pub remote_seq: u32,

    /// Route set, in the order requests must traverse it
    pub route_set: Vec<SipUri>,

    pub local_uri: SipUri,
    pub remote_uri: SipUri,
    /// Where in-dialog requests are sent (peer Contact)
    pub remote_target: SipUri,

    /// True when this side sent the dialog-creating request
    pub is_initiator: bool,

    pub subscription_state: SubscriptionState,

    /// Opaque application data, replicated verbatim
    pub application_data: BTreeMap<String, String>,

    /// Node-local application objects, never replicated
    pub attachments: Attachments,

    /// Transport this dialog is bound to on this node
    pub transport: Option<TransportContext>,

    /// Set when the dialog was rehydrated from a replicated snapshot
    pub recovered_at: Option<SystemTime>,
}

impl LiveDialog {
    /// Create the UAS side of a dialog from the dialog-creating request
    ///
    /// `local_tag` is the To tag this node puts in its responses. The route
    /// set is the Record-Route list in received order and the remote target is
    /// the request's Contact.
    pub fn new_uas(request: &SipRequest, local_tag: impl Into<String>, state: DialogState) -> HaResult<Self> {
        let remote_tag = request
            .from
            .tag
            .clone()
            .ok_or_else(|| HaError::protocol("dialog-creating request without From tag"))?;
        let remote_target = request
            .contact
            .clone()
            .ok_or_else(|| HaError::protocol("dialog-creating request without Contact"))?;

        Ok(Self {
            key: DialogKey::new(request.call_id.clone(), local_tag, remote_tag),
            state,
            local_seq: 0,
            remote_seq: request.cseq,
            route_set: request.record_route.clone(),
            local_uri: request.to.uri.clone(),
            remote_uri: request.from.uri.clone(),
            remote_target,
            is_initiator: false,
            subscription_state: SubscriptionState::None,
            application_data: BTreeMap::new(),
            attachments: Attachments::default(),
            transport: None,
            recovered_at: None,
        })
    }

    /// Create the UAC side of a dialog from our request and the response that established it
    ///
    /// The route set is the response's Record-Route list reversed.
    pub fn new_uac(request: &SipRequest, response: &SipResponse) -> HaResult<Self> {
        let local_tag = request
            .from
            .tag
            .clone()
            .ok_or_else(|| HaError::protocol("request without From tag"))?;
        let remote_tag = response
            .to
            .tag
            .clone()
            .ok_or_else(|| HaError::protocol("dialog-creating response without To tag"))?;
        let remote_target = response
            .contact
            .clone()
            .ok_or_else(|| HaError::protocol("dialog-creating response without Contact"))?;
        let state = if response.is_success() { DialogState::Confirmed } else { DialogState::Early };

        Ok(Self {
            key: DialogKey::new(request.call_id.clone(), local_tag, remote_tag),
            state,
            local_seq: request.cseq,
            remote_seq: 0,
            route_set: response.record_route.iter().rev().cloned().collect(),
            local_uri: request.from.uri.clone(),
            remote_uri: request.to.uri.clone(),
            remote_target,
            is_initiator: true,
            subscription_state: SubscriptionState::None,
            application_data: BTreeMap::new(),
            attachments: Attachments::default(),
            transport: None,
            recovered_at: None,
        })
    }

    /// Rehydrate a dialog from a replicated snapshot and bind it to this node
    pub fn from_snapshot(snapshot: &DialogSnapshot, transport: &TransportContext) -> HaResult<Self> {
        let key = snapshot.key();
        let corrupt = |what: &str, value: &str, e: HaError| {
            HaError::corrupt_snapshot(key.storage_key(), format!("invalid {} '{}': {}", what, value, e))
        };

        let route_set = snapshot
            .route_set
            .iter()
            .map(|entry| entry.parse::<SipUri>().map_err(|e| corrupt("route entry", entry, e)))
            .collect::<HaResult<Vec<_>>>()?;
        let local_uri = snapshot
            .local_uri
            .parse::<SipUri>()
            .map_err(|e| corrupt("local URI", &snapshot.local_uri, e))?;
        let remote_uri = snapshot
            .remote_uri
            .parse::<SipUri>()
            .map_err(|e| corrupt("remote URI", &snapshot.remote_uri, e))?;
        let remote_target = snapshot
            .remote_target
            .parse::<SipUri>()
            .map_err(|e| corrupt("remote target", &snapshot.remote_target, e))?;

        Ok(Self {
            key,
            state: snapshot.state,
            local_seq: snapshot.local_seq,
            remote_seq: snapshot.remote_seq,
            route_set,
            local_uri,
            remote_uri,
            remote_target,
            is_initiator: snapshot.is_initiator,
            subscription_state: snapshot.subscription_state,
            application_data: snapshot.application_data.clone(),
            attachments: Attachments::default(),
            transport: Some(transport.clone()),
            recovered_at: Some(SystemTime::now()),
        })
    }

    /// Bind the dialog to a transport on this node
    pub fn bind(&mut self, transport: TransportContext) {
        self.transport = Some(transport);
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `next`, refusing to regress
    ///
    /// Returns whether the state changed.
    pub fn transition_to(&mut self, next: DialogState) -> HaResult<bool> {
        if !self.state.can_transition_to(next) {
            return Err(HaError::protocol(format!(
                "dialog {} cannot move from {} to {}",
                self.key, self.state, next
            )));
        }
        let changed = self.state != next;
        self.state = next;
        Ok(changed)
    }

    /// Confirm an early dialog; a no-op for confirmed ones
    pub fn confirm(&mut self) -> HaResult<bool> {
        self.transition_to(DialogState::Confirmed)
    }

    /// Terminate the dialog
    pub fn terminate(&mut self) -> bool {
        let changed = !self.is_terminated();
        self.state = DialogState::Terminated;
        changed
    }

    /// Fold in a newer snapshot written by another node while it owned the dialog
    ///
    /// Sequence numbers only move up and the state never regresses. Peer
    /// target and subscription state follow the snapshot; application data
    /// stays as held here, since snapshots may be written without it.
    /// Returns whether anything changed.
    pub fn catch_up(&mut self, snapshot: &DialogSnapshot) -> HaResult<bool> {
        let remote_target = snapshot.remote_target.parse::<SipUri>().map_err(|e| {
            HaError::corrupt_snapshot(
                self.key.storage_key(),
                format!("invalid remote target '{}': {}", snapshot.remote_target, e),
            )
        })?;
        let before = (self.state, self.local_seq, self.remote_seq, self.subscription_state);
        let target_changed = self.remote_target != remote_target;

        self.local_seq = self.local_seq.max(snapshot.local_seq);
        self.remote_seq = self.remote_seq.max(snapshot.remote_seq);
        if snapshot.state > self.state {
            self.state = snapshot.state;
        }
        self.remote_target = remote_target;
        self.subscription_state = snapshot.subscription_state;

        let after = (self.state, self.local_seq, self.remote_seq, self.subscription_state);
        Ok(before != after || target_changed)
    }

    /// Record the CSeq of an in-dialog request from the peer
    ///
    /// Out-of-order requests (lower CSeq) are rejected per RFC 3261 12.2.2.
    /// ACK and CANCEL reuse the CSeq of the request they refer to.
    pub fn accept_remote_cseq(&mut self, method: &Method, cseq: u32) -> HaResult<()> {
        if matches!(method, Method::Ack | Method::Cancel) {
            return Ok(());
        }
        if self.remote_seq != 0 && cseq <= self.remote_seq {
            return Err(HaError::protocol(format!(
                "out of order CSeq {} for dialog {} (last {})",
                cseq, self.key, self.remote_seq
            )));
        }
        self.remote_seq = cseq;
        Ok(())
    }

    /// Update the remote target from a target-refresh request or response
    pub fn refresh_target(&mut self, contact: Option<&SipUri>) {
        if let Some(contact) = contact {
            self.remote_target = contact.clone();
        }
    }

    /// Build an in-dialog request (RFC 3261 12.2.1.1)
    ///
    /// Consumes a local CSeq except for ACK and CANCEL. The route set goes in
    /// as Route headers in order and the Request-URI is the remote target.
    pub fn create_request(&mut self, method: Method) -> SipRequest {
        if !matches!(method, Method::Ack | Method::Cancel) {
            self.local_seq += 1;
        }
        let from = NameAddr::new(self.local_uri.clone(), Some(self.key.local_tag.clone()));
        let to = NameAddr::new(self.remote_uri.clone(), Some(self.key.remote_tag.clone()));

        let mut request = SipRequest::new(
            method,
            self.remote_target.clone(),
            self.key.call_id.clone(),
            from,
            to,
            self.local_seq,
        );
        request.route = self.route_set.clone();
        request.contact = self.transport.as_ref().map(TransportContext::contact);
        if request.method == Method::Notify && self.subscription_state != SubscriptionState::None {
            request.subscription_state = Some(self.subscription_state);
        }
        request
    }

    /// Build a response to an in-dialog request, carrying our tag and Contact
    pub fn create_response(&self, request: &SipRequest, status: u16) -> SipResponse {
        let mut response = SipResponse::for_request(request, status);
        if response.to.tag.is_none() {
            response.to.tag = Some(self.key.local_tag.clone());
        }
        if let Some(transport) = &self.transport {
            response.contact = Some(transport.contact());
        }
        response
    }

    /// True when `request` names this dialog's parties in the right orientation
    ///
    /// A NOTIFY arriving at the subscriber must come From the notifier (our
    /// remote URI) To us (our local URI).
    pub fn matches_parties(&self, request: &SipRequest) -> bool {
        request.from.uri.same_endpoint(&self.remote_uri)
            && request.from.uri.user == self.remote_uri.user
            && request.to.uri.same_endpoint(&self.local_uri)
            && request.to.uri.user == self.local_uri.user
    }
}
