//! In-process cluster shared by the integration tests
//!
//! ```text
//! shootist (5060) ──→ balancer (5050) ──→ node-a (5070)
//!                                     └─→ node-b (5080)
//! ```
//!
//! Both nodes share one `InMemoryCache` and one `ManualClock`. Messages are
//! handed from hop to hop by the harness; nothing touches a socket.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use rvoip_dialog_ha::cache::{dialog_state_key, CacheAdapter, InMemoryCache};
use rvoip_dialog_ha::codec::DialogSnapshot;
use rvoip_dialog_ha::config::{HaConfig, ReplicationStrategy, RetryPolicy};
use rvoip_dialog_ha::dialog::{DialogKey, DialogState, DialogTable, SubscriptionState};
use rvoip_dialog_ha::engine::{SipEngine, TransportContext};
use rvoip_dialog_ha::events::DialogLifecycleEvent;
use rvoip_dialog_ha::message::{Method, NameAddr, SipRequest, SipResponse, SipUri, Via};
use rvoip_dialog_ha::ownership::{ManualClock, NodeId};
use rvoip_dialog_ha::router::{
    ActiveNodeResolver, ClusterMember, LeaseNodeResolver, StaticNodeMap, StatelessForwarder,
};
use rvoip_dialog_ha::{ClusteredDialogManager, HaResult, RequestDisposition};

pub const SHOOTIST_PORT: u16 = 5060;
pub const BALANCER_PORT: u16 = 5050;
pub const NODE_A_PORT: u16 = 5070;
pub const NODE_B_PORT: u16 = 5080;

pub const LEASE_DURATION: Duration = Duration::from_secs(30);
pub const GRACE_PERIOD: Duration = Duration::from_secs(32);

/// Install a test log subscriber once per binary; `RUST_LOG` picks the level
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn local_uri(port: u16) -> SipUri {
    SipUri::new("127.0.0.1", Some(port))
}

fn new_tag(prefix: &str) -> String {
    format!("{}-{:08x}", prefix, rand::random::<u32>())
}

/// Something a node handed to its transport
#[derive(Debug, Clone)]
pub enum Outbound {
    Request(SipRequest),
    Response(SipResponse),
}

/// Engine of one simulated node: a dialog table plus an outbox
pub struct SimEngine {
    pub table: DialogTable,
    outbox: Mutex<VecDeque<Outbound>>,
}

#[async_trait]
impl SipEngine for SimEngine {
    async fn has_dialog(&self, key: &DialogKey) -> bool {
        self.table.contains(key)
    }

    async fn bind_recovered_dialog(&self, snapshot: &DialogSnapshot, _: &TransportContext) -> HaResult<bool> {
        self.table.bind_recovered(snapshot)
    }

    async fn catch_up_dialog(&self, snapshot: &DialogSnapshot) -> HaResult<bool> {
        self.table.catch_up(snapshot)
    }

    async fn send_request(&self, request: SipRequest) -> HaResult<()> {
        self.outbox.lock().push_back(Outbound::Request(request));
        Ok(())
    }

    async fn send_response(&self, response: SipResponse) -> HaResult<()> {
        self.outbox.lock().push_back(Outbound::Response(response));
        Ok(())
    }
}

/// A clustered UAS: accepts INVITE and SUBSCRIBE, answers in-dialog requests with 200
pub struct ClusterNode {
    pub name: &'static str,
    pub address: SipUri,
    pub engine: Arc<SimEngine>,
    pub manager: Arc<ClusteredDialogManager>,
    events: Mutex<mpsc::UnboundedReceiver<DialogLifecycleEvent>>,
    up: AtomicBool,
    ring_only: AtomicBool,
    /// INVITEs answered with a provisional response, by Call-ID
    pending_invites: Mutex<HashMap<String, SipRequest>>,
    /// Responses to requests this node sent
    pub received: Mutex<Vec<SipResponse>>,
}

impl ClusterNode {
    fn new(
        name: &'static str,
        port: u16,
        cache: Arc<InMemoryCache>,
        clock: Arc<ManualClock>,
        strategy: ReplicationStrategy,
    ) -> Self {
        let config = HaConfig::new(name)
            .with_lease_duration(LEASE_DURATION)
            .with_termination_grace_period(GRACE_PERIOD)
            .with_replication_strategy(strategy)
            .with_retry(RetryPolicy::none());
        let address = local_uri(port);
        let transport = TransportContext::new(config.node_id.clone(), address.clone());
        let (sender, receiver) = mpsc::unbounded_channel();
        let engine = Arc::new(SimEngine {
            table: DialogTable::new(transport.clone()).with_event_sender(sender),
            outbox: Mutex::new(VecDeque::new()),
        });
        let manager = ClusteredDialogManager::new(config, cache, engine.clone(), clock, transport)
            .expect("valid node configuration");

        Self {
            name,
            address,
            engine,
            manager,
            events: Mutex::new(receiver),
            up: AtomicBool::new(true),
            ring_only: AtomicBool::new(false),
            pending_invites: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.name)
    }

    pub fn via(&self) -> Via {
        Via::new("127.0.0.1", self.address.effective_port())
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Answer new INVITEs with 180 instead of 200
    pub fn ring_only(&self) {
        self.ring_only.store(true, Ordering::SeqCst);
    }

    /// Stop the node without releasing its leases
    pub async fn crash(&self) {
        self.up.store(false, Ordering::SeqCst);
        self.manager.shutdown(false).await;
    }

    /// Hand raised lifecycle events to the manager and wait until they are replicated
    pub async fn flush(&self) {
        let drained: Vec<DialogLifecycleEvent> = {
            let mut events = self.events.lock();
            std::iter::from_fn(|| events.try_recv().ok()).collect()
        };
        for event in drained {
            self.manager.submit(event);
        }
        self.manager.wait_for_idle().await;
    }

    /// The snapshot currently stored for `key`
    pub async fn stored(&self, key: &DialogKey) -> Option<DialogSnapshot> {
        let entry = self.manager.store().get(&dialog_state_key(key)).await.ok()??;
        self.manager.replication().codec().decode(key, &entry.value).ok()
    }

    fn take_outbound(&self) -> Vec<Outbound> {
        self.engine.outbox.lock().drain(..).collect()
    }

    /// Send an in-dialog request through the lease check; leaves it in the outbox
    pub async fn send_in_dialog(&self, key: &DialogKey, method: Method) -> HaResult<SipRequest> {
        let mut request = self.engine.table.create_request(key, method)?;
        request.push_via(self.via());
        self.manager.send_in_dialog_request(key, request.clone()).await?;
        self.flush().await;
        Ok(request)
    }

    /// Handle a request the balancer delivered
    pub async fn receive(&self, mut request: SipRequest) {
        if request.route.first().is_some_and(|top| top.same_endpoint(&self.address)) {
            request.route.remove(0);
        }
        debug!("[{}] <- {} {}", self.name, request.method, request.call_id);

        match request.method {
            Method::Invite | Method::Subscribe if request.is_dialog_establishing() => {
                self.accept(&request).await
            }
            Method::Cancel if !request.is_in_dialog() => self.cancel(&request).await,
            _ => self.in_dialog(&request).await,
        }
        self.flush().await;
    }

    async fn accept(&self, request: &SipRequest) {
        let ringing = request.method == Method::Invite && self.ring_only.load(Ordering::SeqCst);
        let (status, state) = if ringing { (180, DialogState::Early) } else { (200, DialogState::Confirmed) };

        let key = match self.engine.table.create_uas_dialog(request, new_tag(self.name), state) {
            Ok(key) => key,
            Err(e) => {
                warn!("[{}] Cannot create dialog: {}", self.name, e);
                self.reply(request, 400).await;
                return;
            }
        };
        if request.method == Method::Subscribe {
            let _ = self.engine.table.update(&key, |dialog| {
                dialog.subscription_state = SubscriptionState::Active;
                Ok(())
            });
        }
        if ringing {
            self.pending_invites.lock().insert(request.call_id.clone(), request.clone());
        }
        // Ownership is taken while the creation event is replicated
        self.flush().await;

        let Ok(mut response) = self.engine.table.create_response(&key, request, status) else {
            return;
        };
        if request.method == Method::Subscribe {
            response = response.with_expires(request.expires.unwrap_or(3600));
        }
        if let Err(e) = self.manager.respond_authoritatively(&key, response).await {
            warn!("[{}] Not answering {}: {}", self.name, request.method, e);
        }
    }

    async fn cancel(&self, request: &SipRequest) {
        let table = &self.engine.table;
        let early: Vec<DialogKey> = table
            .find_by_call_id(&request.call_id)
            .into_iter()
            .filter(|key| request.from.tag.as_deref() == Some(key.remote_tag.as_str()))
            .filter(|key| table.get(key).is_some_and(|dialog| dialog.state == DialogState::Early))
            .collect();
        let invite = self.pending_invites.lock().remove(&request.call_id);

        let (Some(invite), false) = (invite, early.is_empty()) else {
            self.reply(request, 481).await;
            return;
        };
        self.reply(request, 200).await;
        for key in early {
            if let Ok(terminated) = table.create_response(&key, &invite, 487) {
                if let Err(e) = self.manager.respond_authoritatively(&key, terminated).await {
                    warn!("[{}] Not answering INVITE: {}", self.name, e);
                }
            }
            let _ = table.terminate(&key, "CANCEL");
        }
    }

    async fn in_dialog(&self, request: &SipRequest) {
        let Some(key) = DialogKey::from_uas_request(request) else {
            self.reply(request, 481).await;
            return;
        };
        match self.manager.resolve_in_dialog(&key).await {
            RequestDisposition::Proceed => {}
            RequestDisposition::Forward { owner } => {
                debug!("[{}] {} belongs to {}", self.name, key, owner);
                return;
            }
            RequestDisposition::Reject { status, .. } => {
                self.reply(request, status).await;
                return;
            }
        }

        if let Err(e) = self.engine.table.receive_request(&key, request) {
            warn!("[{}] Rejecting {}: {}", self.name, request.method, e);
            self.reply(request, 500).await;
            return;
        }
        if request.method == Method::Ack {
            return;
        }
        let Ok(response) = self.engine.table.create_response(&key, request, 200) else {
            return;
        };
        if let Err(e) = self.manager.respond_authoritatively(&key, response).await {
            warn!("[{}] Not answering {}: {}", self.name, request.method, e);
            return;
        }
        if request.method == Method::Bye {
            let _ = self.engine.table.terminate(&key, "BYE");
        }
    }

    /// Stateless answer; no dialog or lease involved
    async fn reply(&self, request: &SipRequest, status: u16) {
        let _ = self.engine.send_response(SipResponse::for_request(request, status)).await;
    }
}

/// The far-end UA driving the calls
pub struct Shootist {
    pub table: DialogTable,
    pub address: SipUri,
    /// In-dialog requests received from the cluster
    pub received: Mutex<Vec<SipRequest>>,
}

impl Shootist {
    fn new() -> Self {
        let address = local_uri(SHOOTIST_PORT);
        Self {
            table: DialogTable::new(TransportContext::new(NodeId::new("shootist"), address.clone())),
            address,
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn via(&self) -> Via {
        Via::new("127.0.0.1", SHOOTIST_PORT)
    }

    fn initial(&self, method: Method, call_id: &str) -> SipRequest {
        let mut request = SipRequest::new(
            method,
            "sip:LittleGuy@127.0.0.1:5050".parse().expect("valid uri"),
            call_id,
            NameAddr::new("sip:BigGuy@here.com".parse().expect("valid uri"), Some(new_tag("shootist"))),
            NameAddr::new("sip:LittleGuy@there.com".parse().expect("valid uri"), None),
            1,
        );
        request.contact = Some(self.address.clone().with_user("BigGuy"));
        request
    }

    pub fn invite(&self, call_id: &str) -> SipRequest {
        self.initial(Method::Invite, call_id)
    }

    pub fn subscribe(&self, call_id: &str) -> SipRequest {
        let mut request = self.initial(Method::Subscribe, call_id);
        request.event = Some("presence".to_string());
        request.expires = Some(3600);
        request
    }

    /// CANCEL for a pending INVITE
    pub fn cancel(&self, invite: &SipRequest) -> SipRequest {
        let mut cancel = invite.clone();
        cancel.method = Method::Cancel;
        cancel.via.clear();
        cancel.body = None;
        cancel
    }

    /// Create our side of the dialog from the request we sent and its 2xx
    pub fn establish(&self, request: &SipRequest, response: &SipResponse) -> HaResult<DialogKey> {
        self.table.create_uac_dialog(request, response)
    }

    pub fn in_dialog(&self, key: &DialogKey, method: Method) -> HaResult<SipRequest> {
        self.table.create_request(key, method)
    }

    /// Answer a request arriving from the cluster
    pub fn answer(&self, request: &SipRequest) -> SipResponse {
        self.received.lock().push(request.clone());
        let Some(key) = DialogKey::from_uas_request(request).filter(|key| self.table.contains(key)) else {
            return SipResponse::for_request(request, 481);
        };
        match self.table.receive_request(&key, request) {
            Ok(()) => self
                .table
                .create_response(&key, request, 200)
                .unwrap_or_else(|_| SipResponse::for_request(request, 500)),
            Err(_) => SipResponse::for_request(request, 500),
        }
    }
}

/// How the balancer picks nodes
pub enum Routing {
    /// An administrator marks the active node
    Static,
    /// Follow the replicated ownership records
    Lease,
}

pub struct Harness {
    pub cache: Arc<InMemoryCache>,
    pub clock: Arc<ManualClock>,
    pub node_map: Arc<StaticNodeMap>,
    pub balancer: StatelessForwarder,
    pub shootist: Shootist,
    pub a: ClusterNode,
    pub b: ClusterNode,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(ReplicationStrategy::ConfirmedDialog, Routing::Static)
    }

    pub fn build(strategy: ReplicationStrategy, routing: Routing) -> Self {
        init_logging();
        let cache = Arc::new(InMemoryCache::named("cluster"));
        let clock = Arc::new(ManualClock::default());
        let members = vec![
            ClusterMember::new("node-a", local_uri(NODE_A_PORT)),
            ClusterMember::new("node-b", local_uri(NODE_B_PORT)),
        ];
        let node_map = Arc::new(StaticNodeMap::new(members.clone()).expect("members"));
        let resolver: Arc<dyn ActiveNodeResolver> = match routing {
            Routing::Static => node_map.clone() as Arc<dyn ActiveNodeResolver>,
            Routing::Lease => {
                let store = Arc::new(CacheAdapter::new(cache.clone(), Duration::from_secs(1), RetryPolicy::none()));
                Arc::new(LeaseNodeResolver::new(members, store, clock.clone()).expect("members"))
                    as Arc<dyn ActiveNodeResolver>
            }
        };

        Self {
            a: ClusterNode::new("node-a", NODE_A_PORT, cache.clone(), clock.clone(), strategy),
            b: ClusterNode::new("node-b", NODE_B_PORT, cache.clone(), clock.clone(), strategy),
            balancer: StatelessForwarder::new(local_uri(BALANCER_PORT), resolver),
            shootist: Shootist::new(),
            node_map,
            cache,
            clock,
        }
    }

    fn node_at(&self, uri: &SipUri) -> Option<&ClusterNode> {
        [&self.a, &self.b].into_iter().find(|node| node.address.same_endpoint(uri))
    }

    /// Crash node A, point the balancer at B and let A's leases run out
    pub async fn fail_over(&self) {
        self.a.crash().await;
        self.node_map.set_active(&self.b.node_id()).expect("node-b is a member");
        self.clock.advance(LEASE_DURATION + Duration::from_secs(1));
    }

    /// Send a request from the shootist; returns the responses that reach it
    pub async fn shootist_sends(&self, mut request: SipRequest) -> Vec<SipResponse> {
        request.push_via(self.shootist.via());
        let decision = match self.balancer.forward_request(&mut request).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("Balancer dropped {}: {}", request.method, e);
                return Vec::new();
            }
        };
        let Some(node) = self.node_at(&decision.next_hop).filter(|node| node.is_up()) else {
            debug!("{} to {} lost", request.method, decision.next_hop);
            return Vec::new();
        };
        node.receive(request).await;

        let mut responses = Vec::new();
        for outbound in node.take_outbound() {
            match outbound {
                Outbound::Response(mut response) => {
                    if let Ok(next) = self.balancer.forward_response(&mut response) {
                        if next.host_port() == self.shootist.via().host_port() {
                            responses.push(response);
                        }
                    }
                }
                Outbound::Request(request) => node.engine.outbox.lock().push_back(Outbound::Request(request)),
            }
        }
        responses
    }

    /// Carry the requests `node` sent to the shootist and bring the answers back
    pub async fn deliver_from(&self, node: &ClusterNode) -> Vec<SipResponse> {
        let mut answers = Vec::new();
        for outbound in node.take_outbound() {
            let Outbound::Request(mut request) = outbound else {
                continue;
            };
            let Ok(decision) = self.balancer.forward_request(&mut request).await else {
                continue;
            };
            if !decision.next_hop.same_endpoint(&self.shootist.address) {
                continue;
            }
            let mut response = self.shootist.answer(&request);
            if let Ok(next) = self.balancer.forward_response(&mut response) {
                if next.host_port() == node.via().host_port() {
                    node.received.lock().push(response.clone());
                    answers.push(response);
                }
            }
        }
        answers
    }

    /// INVITE → 200 → ACK; returns the shootist's and the cluster's key of the call
    pub async fn establish_call(&self, call_id: &str) -> (DialogKey, DialogKey) {
        let invite = self.shootist.invite(call_id);
        let responses = self.shootist_sends(invite.clone()).await;
        let ok = responses.iter().find(|r| r.is_success()).expect("INVITE answered with 2xx");
        let uac_key = self.shootist.establish(&invite, ok).expect("UAC dialog");

        let ack = self.shootist.in_dialog(&uac_key, Method::Ack).expect("ACK");
        self.shootist_sends(ack).await;
        let uas_key = DialogKey::new(call_id, uac_key.remote_tag.clone(), uac_key.local_tag.clone());
        (uac_key, uas_key)
    }
}
