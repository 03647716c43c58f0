//! Ordered per-dialog event processing
//!
//! Each dialog gets a worker task fed by its own channel, so events of one
//! dialog are replicated in the order they were raised while different
//! dialogs proceed in parallel. Workers exit after an idle period; the map
//! entry is removed under the shard lock only when the channel is empty, so
//! no event is stranded in a worker that is going away.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::dialog::DialogKey;
use crate::errors::HaError;
use crate::events::DialogLifecycleEvent;
use crate::replication::{ReplicationManager, ReplicationOutcome};
use crate::scheduler::DeferredActions;

/// Which worker an event runs on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum WorkerKey {
    Dialog(DialogKey),
    /// Transactions outside any dialog, by branch
    Transaction(String),
}

impl WorkerKey {
    fn of(event: &DialogLifecycleEvent) -> Self {
        match (event.dialog_key(), event) {
            (Some(key), _) => WorkerKey::Dialog(key.clone()),
            (None, DialogLifecycleEvent::TransactionStateChanged { transaction })
            | (None, DialogLifecycleEvent::TransactionTerminated { transaction }) => {
                WorkerKey::Transaction(transaction.branch.clone())
            }
            // Dialog events always carry a key
            (None, _) => WorkerKey::Transaction(String::new()),
        }
    }
}

type Workers = DashMap<WorkerKey, mpsc::UnboundedSender<DialogLifecycleEvent>>;

struct Shared {
    workers: Workers,
    replication: Arc<ReplicationManager>,
    deferred: Arc<DeferredActions>,
    idle_timeout: Duration,
    pending: AtomicUsize,
    idle: Notify,
    token: CancellationToken,
}

/// Fan-out of lifecycle events to per-dialog workers
#[derive(Clone)]
pub(crate) struct KeyedEventLoop {
    shared: Arc<Shared>,
}

impl KeyedEventLoop {
    pub(crate) fn new(
        replication: Arc<ReplicationManager>,
        deferred: Arc<DeferredActions>,
        idle_timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                workers: DashMap::new(),
                replication,
                deferred,
                idle_timeout,
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                token,
            }),
        }
    }

    /// Queue an event behind earlier events of the same dialog
    pub(crate) fn submit(&self, event: DialogLifecycleEvent) {
        if self.shared.token.is_cancelled() {
            debug!("Dropping {} event after shutdown", event.kind());
            return;
        }
        let key = WorkerKey::of(&event);
        self.shared.pending.fetch_add(1, Ordering::SeqCst);

        match self.shared.workers.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if let Err(mpsc::error::SendError(event)) = entry.get().send(event) {
                    // The worker is gone without deregistering; replace it
                    let sender = self.spawn_worker(key, event);
                    entry.insert(sender);
                }
            }
            Entry::Vacant(entry) => {
                let sender = self.spawn_worker(key, event);
                entry.insert(sender);
            }
        }
    }

    fn spawn_worker(&self, key: WorkerKey, first: DialogLifecycleEvent) -> mpsc::UnboundedSender<DialogLifecycleEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail
        let _ = sender.send(first);
        trace!("Starting event worker for {:?}", key);
        tokio::spawn(run_worker(Arc::clone(&self.shared), key, receiver));
        sender
    }

    /// Events submitted but not yet fully handled
    pub(crate) fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    /// Wait until every submitted event has been handled
    pub(crate) async fn wait_for_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 || self.shared.token.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    key: WorkerKey,
    mut receiver: mpsc::UnboundedReceiver<DialogLifecycleEvent>,
) {
    loop {
        let next = tokio::select! {
            _ = shared.token.cancelled() => break,
            next = tokio::time::timeout(shared.idle_timeout, receiver.recv()) => next,
        };

        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => {
                let mut leftover = None;
                shared.workers.remove_if(&key, |_, _| match receiver.try_recv() {
                    Ok(event) => {
                        leftover = Some(event);
                        false
                    }
                    Err(_) => true,
                });
                match leftover {
                    Some(event) => event,
                    None => {
                        trace!("Event worker for {:?} idle, exiting", key);
                        break;
                    }
                }
            }
        };

        handle_event(&shared, event).await;
        if shared.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            shared.idle.notify_waiters();
        }
    }
}

async fn handle_event(shared: &Shared, event: DialogLifecycleEvent) {
    if let DialogLifecycleEvent::DialogTerminated { dialog, .. } = &event {
        let cancelled = shared.deferred.cancel_all(&dialog.key);
        if cancelled > 0 {
            debug!("Cancelled {} deferred actions of terminated dialog {}", cancelled, dialog.key);
        }
    }

    let kind = event.kind();
    let key = event.dialog_key().cloned();
    match shared.replication.dispatch(event).await {
        Ok(ReplicationOutcome::Degraded) => {
            debug!("{} for {:?} parked until the backend recovers", kind, key)
        }
        Ok(outcome) => trace!("{} for {:?}: {:?}", kind, key, outcome),
        Err(e @ HaError::NotOwner { .. }) => {
            warn!("Not replicating {} for {:?}: {}", kind, key, e)
        }
        Err(e) => warn!("Replication of {} for {:?} failed: {}", kind, key, e),
    }
}
