//! Which cluster node should see a request

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::cache::{ownership_key, CacheAdapter};
use crate::dialog::DialogKey;
use crate::errors::{HaError, HaResult};
use crate::message::{SipRequest, SipUri};
use crate::ownership::{Clock, NodeId, OwnershipRecord};

/// A node of the cluster and the address it receives SIP on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    pub node_id: NodeId,
    pub address: SipUri,
}

impl ClusterMember {
    pub fn new(node_id: impl Into<String>, address: SipUri) -> Self {
        Self { node_id: NodeId::new(node_id), address }
    }
}

/// Source of the routing target for requests entering the cluster
#[async_trait]
pub trait ActiveNodeResolver: Send + Sync {
    /// Node currently responsible for the dialog of an in-dialog request
    ///
    /// `None` leaves the request to its Request-URI.
    async fn active_node(&self, request: &SipRequest) -> HaResult<Option<SipUri>>;

    /// Node that should establish a new dialog
    fn designated_node(&self, request: &SipRequest) -> Option<SipUri>;

    /// Whether `uri` addresses one of the cluster nodes
    fn is_cluster_member(&self, uri: &SipUri) -> bool;
}

fn member_for<'a>(members: &'a [ClusterMember], uri: &SipUri) -> Option<&'a ClusterMember> {
    members.iter().find(|m| m.address.same_endpoint(uri))
}

/// Operator-maintained mapping: one active node takes all traffic
///
/// Failover is an explicit [`set_active`](Self::set_active) call, the way a
/// load balancer is repointed after a health check fails.
#[derive(Debug)]
pub struct StaticNodeMap {
    members: Vec<ClusterMember>,
    active: RwLock<usize>,
}

impl StaticNodeMap {
    /// The first member starts out active
    pub fn new(members: Vec<ClusterMember>) -> HaResult<Self> {
        if members.is_empty() {
            return Err(HaError::config("a cluster needs at least one member"));
        }
        Ok(Self { members, active: RwLock::new(0) })
    }

    /// Send all traffic to `node` from now on
    pub fn set_active(&self, node: &NodeId) -> HaResult<()> {
        let index = self
            .members
            .iter()
            .position(|m| &m.node_id == node)
            .ok_or_else(|| HaError::config(format!("{} is not a cluster member", node)))?;
        *self.active.write() = index;
        debug!("Active cluster node is now {}", node);
        Ok(())
    }

    pub fn active(&self) -> &ClusterMember {
        &self.members[*self.active.read()]
    }

    pub fn members(&self) -> &[ClusterMember] {
        &self.members
    }
}

#[async_trait]
impl ActiveNodeResolver for StaticNodeMap {
    async fn active_node(&self, _request: &SipRequest) -> HaResult<Option<SipUri>> {
        Ok(Some(self.active().address.clone()))
    }

    fn designated_node(&self, _request: &SipRequest) -> Option<SipUri> {
        Some(self.active().address.clone())
    }

    fn is_cluster_member(&self, uri: &SipUri) -> bool {
        member_for(&self.members, uri).is_some()
    }
}

/// Routes by the replicated ownership records
///
/// In-dialog requests go to the node holding the dialog's live lease. When
/// the lease has run out the next member after the old owner is chosen, so
/// the request triggers recovery there.
#[derive(Debug)]
pub struct LeaseNodeResolver {
    members: Vec<ClusterMember>,
    store: Arc<CacheAdapter>,
    clock: Arc<dyn Clock>,
}

impl LeaseNodeResolver {
    pub fn new(members: Vec<ClusterMember>, store: Arc<CacheAdapter>, clock: Arc<dyn Clock>) -> HaResult<Self> {
        if members.is_empty() {
            return Err(HaError::config("a cluster needs at least one member"));
        }
        Ok(Self { members, store, clock })
    }

    async fn record(&self, key: &DialogKey) -> HaResult<Option<OwnershipRecord>> {
        match self.store.get(&ownership_key(key)).await? {
            Some(entry) => match OwnershipRecord::decode(key, &entry.value) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    debug!("Ignoring ownership record of {}: {}", key, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn successor(&self, node: &NodeId) -> Option<&ClusterMember> {
        let index = self.members.iter().position(|m| &m.node_id == node)?;
        let next = (index + 1) % self.members.len();
        (next != index).then(|| &self.members[next])
    }
}

#[async_trait]
impl ActiveNodeResolver for LeaseNodeResolver {
    async fn active_node(&self, request: &SipRequest) -> HaResult<Option<SipUri>> {
        // The cluster side may be either UAS or UAC of the dialog
        let candidates = [DialogKey::from_uas_request(request), DialogKey::from_uac_request(request)];
        for key in candidates.into_iter().flatten() {
            let Some(record) = self.record(&key).await? else {
                continue;
            };
            let owner = self.members.iter().find(|m| m.node_id == record.node);
            if record.is_live(self.clock.now_ms()) {
                return Ok(owner.map(|m| m.address.clone()));
            }
            let next = self.successor(&record.node);
            debug!(
                "Lease of {} on {} expired, designating {:?}",
                key,
                record.node,
                next.map(|m| &m.node_id)
            );
            return Ok(next.map(|m| m.address.clone()));
        }
        Ok(None)
    }

    fn designated_node(&self, request: &SipRequest) -> Option<SipUri> {
        let mut hasher = DefaultHasher::new();
        request.call_id.hash(&mut hasher);
        let index = (hasher.finish() % self.members.len() as u64) as usize;
        Some(self.members[index].address.clone())
    }

    fn is_cluster_member(&self, uri: &SipUri) -> bool {
        member_for(&self.members, uri).is_some()
    }
}
