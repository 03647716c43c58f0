//! Clustered dialog manager
//!
//! [`ClusteredDialogManager`] is the facade a clustered node runs. It wires
//! the cache adapter, lease manager, replication and recovery together and
//! makes the decisions that sit at the request-handling boundary:
//!
//! - lifecycle events from the SIP engine go through [`submit`](ClusteredDialogManager::submit)
//!   to one ordered worker per dialog, which hands them to replication
//! - an in-dialog request is checked with
//!   [`resolve_in_dialog`](ClusteredDialogManager::resolve_in_dialog), which
//!   recovers unknown dialogs and turns failures into a [`RequestDisposition`]
//! - authoritative responses and in-dialog requests are only sent under a
//!   valid lease
//! - a maintenance task renews leases, cancels deferred work of lost dialogs
//!   and flushes snapshots parked during a backend outage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_dialog_ha::cache::InMemoryCache;
//! use rvoip_dialog_ha::config::HaConfig;
//! use rvoip_dialog_ha::engine::{SipEngine, TransportContext};
//! use rvoip_dialog_ha::manager::ClusteredDialogManager;
//! use rvoip_dialog_ha::ownership::SystemClock;
//!
//! # async fn example(engine: Arc<dyn SipEngine>) -> rvoip_dialog_ha::errors::HaResult<()> {
//! let config = HaConfig::new("node-a");
//! let transport = TransportContext::new(config.node_id.clone(), "sip:10.0.0.1:5070".parse()?);
//! let manager = ClusteredDialogManager::new(
//!     config,
//!     Arc::new(InMemoryCache::new()),
//!     engine,
//!     Arc::new(SystemClock),
//!     transport,
//! )?;
//! manager.start();
//! // ... feed lifecycle events with manager.submit(event)
//! manager.shutdown(true).await;
//! # Ok(())
//! # }
//! ```

mod event_loop;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{ApplicationCache, BackendHealthReport, CacheAdapter, CacheBackend};
use crate::config::HaConfig;
use crate::dialog::DialogKey;
use crate::engine::{SipEngine, TransportContext};
use crate::errors::{HaError, HaResult, RequestDisposition};
use crate::events::DialogLifecycleEvent;
use crate::message::{SipRequest, SipResponse};
use crate::ownership::{Clock, KeyedLocks, LeaseManager, NodeId};
use crate::recovery::FailoverRecoveryManager;
use crate::replication::{ReplicationManager, ReplicationStatsSnapshot};
use crate::scheduler::DeferredActions;

use event_loop::KeyedEventLoop;

/// Point-in-time view of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaStatus {
    pub node_id: NodeId,
    pub backend: BackendHealthReport,
    pub replication: ReplicationStatsSnapshot,
    pub held_leases: usize,
    pub pending_events: usize,
    pub pending_snapshots: usize,
    pub recovered_dialogs: u64,
}

/// Result of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Dialogs whose lease turned out to be lost
    pub lost: Vec<DialogKey>,
    /// Parked snapshots written
    pub resynced: usize,
}

/// Replication and failover for one clustered node
pub struct ClusteredDialogManager {
    config: HaConfig,
    transport: TransportContext,
    store: Arc<CacheAdapter>,
    leases: Arc<LeaseManager>,
    replication: Arc<ReplicationManager>,
    recovery: FailoverRecoveryManager,
    engine: Arc<dyn SipEngine>,
    deferred: Arc<DeferredActions>,
    events: KeyedEventLoop,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ClusteredDialogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteredDialogManager")
            .field("node_id", &self.config.node_id)
            .field("backend", &self.store.backend_name())
            .finish()
    }
}

impl ClusteredDialogManager {
    /// Build the manager; nothing runs until [`start`](Self::start)
    pub fn new(
        config: HaConfig,
        backend: Arc<dyn CacheBackend>,
        engine: Arc<dyn SipEngine>,
        clock: Arc<dyn Clock>,
        transport: TransportContext,
    ) -> HaResult<Arc<Self>> {
        config.validate()?;
        if transport.node_id != config.node_id {
            return Err(HaError::config(format!(
                "transport context belongs to {}, configuration to {}",
                transport.node_id, config.node_id
            )));
        }

        let store = Arc::new(CacheAdapter::new(backend, config.cache_operation_timeout, config.retry.clone()));
        let locks = Arc::new(KeyedLocks::new());
        let leases = Arc::new(LeaseManager::new(
            config.node_id.clone(),
            store.clone(),
            clock,
            locks.clone(),
            config.lease_duration,
            config.lease_safety_margin,
        ));
        let replication = Arc::new(ReplicationManager::new(&config, store.clone(), leases.clone(), locks.clone()));
        let recovery = FailoverRecoveryManager::new(
            store.clone(),
            leases.clone(),
            locks,
            replication.clone(),
            engine.clone(),
            transport.clone(),
        );
        let deferred = Arc::new(DeferredActions::new(config.node_id.to_string()));
        let token = CancellationToken::new();
        let events = KeyedEventLoop::new(
            replication.clone(),
            deferred.clone(),
            config.event_worker_idle_timeout,
            token.child_token(),
        );

        info!(
            "Dialog HA node {} using {} backend ({:?})",
            config.node_id,
            store.backend_name(),
            config.replication_strategy
        );
        Ok(Arc::new(Self {
            config,
            transport,
            store,
            leases,
            replication,
            recovery,
            engine,
            deferred,
            events,
            token,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Start lease renewal and parked-snapshot resync
    pub fn start(&self) {
        let handle = tokio::spawn(run_maintenance(
            self.leases.clone(),
            self.replication.clone(),
            self.deferred.clone(),
            self.config.lease_renew_interval,
            self.config.maintenance_interval,
            self.token.child_token(),
        ));
        self.tasks.lock().push(handle);
        debug!("Maintenance started for {}", self.config.node_id);
    }

    /// Feed every event received on `receiver` into [`submit`](Self::submit)
    ///
    /// Events still in the channel are not counted by
    /// [`wait_for_idle`](Self::wait_for_idle).
    pub fn attach(&self, mut receiver: mpsc::UnboundedReceiver<DialogLifecycleEvent>) {
        let events = self.events.clone();
        let token = self.token.child_token();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = receiver.recv() => match event {
                        Some(event) => events.submit(event),
                        None => break,
                    },
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Queue a lifecycle event for replication
    pub fn submit(&self, event: DialogLifecycleEvent) {
        self.events.submit(event);
    }

    /// Wait until every submitted event has been replicated
    pub async fn wait_for_idle(&self) {
        self.events.wait_for_idle().await;
    }

    /// Decide how to treat an in-dialog request for `key`
    ///
    /// A dialog the engine does not know is recovered from the cache first.
    pub async fn resolve_in_dialog(&self, key: &DialogKey) -> RequestDisposition {
        if self.engine.has_dialog(key).await {
            if self.leases.holds_valid_lease(key) {
                return RequestDisposition::Proceed;
            }
            return match self.recovery.reclaim(key).await {
                Ok(()) => RequestDisposition::Proceed,
                Err(e) => {
                    warn!("[{}] Reclaiming {} failed: {}", self.config.node_id, key, e);
                    e.disposition()
                }
            };
        }

        match self.recovery.recover(key).await {
            Ok(outcome) => {
                debug!("[{}] {} ready after recovery: {:?}", self.config.node_id, key, outcome);
                RequestDisposition::Proceed
            }
            Err(e) => {
                warn!("[{}] Cannot serve request for {}: {}", self.config.node_id, key, e);
                e.disposition()
            }
        }
    }

    /// [`resolve_in_dialog`](Self::resolve_in_dialog) for a received request
    ///
    /// Requests outside a dialog always proceed.
    pub async fn resolve_request(&self, request: &SipRequest) -> RequestDisposition {
        match DialogKey::from_uas_request(request) {
            Some(key) => self.resolve_in_dialog(&key).await,
            None => RequestDisposition::Proceed,
        }
    }

    /// Send a final response for `key`, only while owning its lease
    pub async fn respond_authoritatively(&self, key: &DialogKey, response: SipResponse) -> HaResult<()> {
        self.leases.authorize(key).await?;
        self.engine.send_response(response).await
    }

    /// Send an in-dialog request for `key`, only while owning its lease
    pub async fn send_in_dialog_request(&self, key: &DialogKey, request: SipRequest) -> HaResult<()> {
        self.leases.authorize(key).await?;
        self.engine.send_request(request).await
    }

    /// Run `action` after `delay`, unless the dialog terminates or its lease is lost first
    pub fn schedule_deferred<F>(&self, key: &DialogKey, name: impl Into<String>, delay: Duration, action: F) -> u64
    where
        F: Future<Output = HaResult<()>> + Send + 'static,
    {
        let leases = self.leases.clone();
        let target = key.clone();
        let name = name.into();
        let label = name.clone();
        self.deferred.schedule(key, name, delay, async move {
            if !leases.holds_valid_lease(&target) {
                warn!("Skipping {} for {}: lease no longer held", label, target);
                return;
            }
            if let Err(e) = action.await {
                warn!("Deferred {} for {} failed: {}", label, target, e);
            }
        })
    }

    pub fn cancel_deferred(&self, key: &DialogKey, id: u64) -> bool {
        self.deferred.cancel(key, id)
    }

    pub fn pending_deferred(&self, key: &DialogKey) -> usize {
        self.deferred.pending(key)
    }

    /// Named application cache shared across the cluster
    pub fn application_cache(&self, name: &str) -> ApplicationCache {
        ApplicationCache::new(name, self.store.clone())
    }

    /// One lease-renewal and resync pass, as the maintenance task runs it
    pub async fn run_maintenance_cycle(&self) -> MaintenanceReport {
        let lost = renew_leases(&self.leases, &self.replication, &self.deferred).await;
        let resynced = self.replication.resync_pending().await;
        MaintenanceReport { lost, resynced }
    }

    pub fn health(&self) -> BackendHealthReport {
        self.store.health()
    }

    pub fn status(&self) -> HaStatus {
        HaStatus {
            node_id: self.config.node_id.clone(),
            backend: self.store.health(),
            replication: self.replication.stats(),
            held_leases: self.leases.held_keys().len(),
            pending_events: self.events.pending(),
            pending_snapshots: self.replication.pending_count(),
            recovered_dialogs: self.recovery.recovered_count(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &HaConfig {
        &self.config
    }

    pub fn transport(&self) -> &TransportContext {
        &self.transport
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn replication(&self) -> &Arc<ReplicationManager> {
        &self.replication
    }

    pub fn recovery(&self) -> &FailoverRecoveryManager {
        &self.recovery
    }

    pub fn store(&self) -> &Arc<CacheAdapter> {
        &self.store
    }

    /// Stop all background work
    ///
    /// With `release_leases` every held lease is given up so peers can take
    /// the dialogs over at once; otherwise they expire on their own.
    pub async fn shutdown(&self, release_leases: bool) {
        info!("Shutting down dialog HA node {}", self.config.node_id);
        self.token.cancel();
        self.deferred.shutdown();
        self.replication.shutdown();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task of {} ended abnormally: {}", self.config.node_id, e);
            }
        }

        if release_leases {
            let released = self.leases.release_all().await;
            info!("Released {} leases held by {}", released, self.config.node_id);
        }
        debug!("{} event workers left at shutdown", self.events.worker_count());
    }
}

async fn renew_leases(
    leases: &LeaseManager,
    replication: &ReplicationManager,
    deferred: &DeferredActions,
) -> Vec<DialogKey> {
    let lost = leases.renew_all().await;
    for key in &lost {
        let cancelled = deferred.cancel_all(key);
        replication.forget(key);
        warn!("Lost ownership of {}, cancelled {} deferred actions", key, cancelled);
    }
    lost
}

async fn run_maintenance(
    leases: Arc<LeaseManager>,
    replication: Arc<ReplicationManager>,
    deferred: Arc<DeferredActions>,
    renew_interval: Duration,
    resync_interval: Duration,
    token: CancellationToken,
) {
    let mut renew = tokio::time::interval(renew_interval);
    renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut resync = tokio::time::interval(resync_interval);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = renew.tick() => {
                renew_leases(&leases, &replication, &deferred).await;
            }
            _ = resync.tick() => {
                let resynced = replication.resync_pending().await;
                if resynced > 0 {
                    info!("Resynced {} parked snapshots", resynced);
                }
            }
        }
    }
    debug!("Maintenance loop stopped");
}
