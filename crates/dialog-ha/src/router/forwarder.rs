//! Stateless load-balancer forwarding
//!
//! For each request the forwarder applies, in order:
//!
//! 1. Max-Forwards: insert 70 when absent, reject at 0 (483), else decrement
//! 2. drop the top Route when it names this hop
//! 3. push a Via for this hop
//! 4. dialog-establishing requests: Record-Route this hop (`lr`) and Route to
//!    the designated node
//! 5. in-dialog requests heading into the cluster: Route to the active node
//! 6. CANCEL outside a dialog: Route to the designated node, like its INVITE
//!
//! Responses only lose the Via this hop added.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::errors::{HaError, HaResult};
use crate::message::{Method, SipRequest, SipResponse, SipUri, Via};

use super::ActiveNodeResolver;

/// Where a forwarded request goes next
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardDecision {
    /// Endpoint the request is sent to
    pub next_hop: SipUri,
    /// Set when a Route to a cluster node was inserted
    pub routed_to_node: Option<SipUri>,
}

/// Stateless forwarder in front of the cluster
pub struct StatelessForwarder {
    local: SipUri,
    resolver: Arc<dyn ActiveNodeResolver>,
}

impl std::fmt::Debug for StatelessForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatelessForwarder").field("local", &self.local).finish()
    }
}

impl StatelessForwarder {
    pub fn new(local: SipUri, resolver: Arc<dyn ActiveNodeResolver>) -> Self {
        Self { local, resolver }
    }

    /// Address of this hop
    pub fn local(&self) -> &SipUri {
        &self.local
    }

    /// Rewrite `request` for its next hop
    pub async fn forward_request(&self, request: &mut SipRequest) -> HaResult<ForwardDecision> {
        request.max_forwards = match request.max_forwards {
            None => Some(crate::message::request::DEFAULT_MAX_FORWARDS),
            Some(0) => {
                return Err(HaError::TooManyHops { method: request.method.to_string() });
            }
            Some(n) => Some(n - 1),
        };

        if request.route.first().is_some_and(|top| top.same_endpoint(&self.local)) {
            request.route.remove(0);
        }

        request.push_via(Via::new(self.local.host.clone(), self.local.effective_port()));

        let mut routed_to_node = None;
        if request.is_dialog_establishing() {
            request.record_route.insert(0, self.local.clone().with_lr());
            if let Some(node) = self.resolver.designated_node(request) {
                request.route.insert(0, node.clone().with_lr());
                routed_to_node = Some(node);
            }
        } else if request.is_in_dialog() && self.resolver.is_cluster_member(request.next_hop()) {
            if let Some(node) = self.resolver.active_node(request).await? {
                if !node.same_endpoint(request.next_hop()) {
                    debug!("Rerouting {} for {} to {}", request.method, request.call_id, node);
                }
                request.route.insert(0, node.clone().with_lr());
                routed_to_node = Some(node);
            }
        } else if request.method == Method::Cancel && !request.is_in_dialog() {
            if let Some(node) = self.resolver.designated_node(request) {
                request.route.insert(0, node.clone().with_lr());
                routed_to_node = Some(node);
            }
        }

        let next_hop = request.next_hop().clone();
        trace!("{} {} -> {}", request.method, request.call_id, next_hop);
        Ok(ForwardDecision { next_hop, routed_to_node })
    }

    /// Remove this hop's Via; returns the hop the response goes to next
    pub fn forward_response(&self, response: &mut SipResponse) -> HaResult<Via> {
        if response.via.first().is_some_and(|top| top.is_for(&self.local)) {
            response.via.remove(0);
        }
        response
            .via
            .first()
            .cloned()
            .ok_or_else(|| HaError::protocol(format!("{} response without a Via to follow", response.status)))
    }
}
