//! Per-dialog deferred actions
//!
//! Timer-driven work tied to a dialog, such as a final response sent after a
//! delay or the purge of a terminated snapshot, runs as a tracked tokio task
//! with its own cancellation token. Tokens are children of one root token,
//! so [`DeferredActions::shutdown`] stops everything at once, while
//! [`DeferredActions::cancel_all`] stops only one dialog's actions
//! (termination, lease loss).

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dialog::DialogKey;

#[derive(Debug, Clone)]
struct ScheduledAction {
    id: u64,
    name: String,
    token: CancellationToken,
}

/// Cancellable delayed tasks grouped by dialog
#[derive(Debug)]
pub struct DeferredActions {
    label: String,
    actions: Arc<DashMap<DialogKey, Vec<ScheduledAction>>>,
    root: CancellationToken,
    next_id: AtomicU64,
    fired: Arc<AtomicUsize>,
}

impl DeferredActions {
    /// Create an empty scheduler; `label` prefixes its log lines
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            actions: Arc::new(DashMap::new()),
            root: CancellationToken::new(),
            next_id: AtomicU64::new(1),
            fired: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run `action` after `delay` unless cancelled first
    ///
    /// Returns an id usable with [`cancel`](Self::cancel).
    pub fn schedule<F>(&self, key: &DialogKey, name: impl Into<String>, delay: Duration, action: F) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        let token = self.root.child_token();

        self.actions.entry(key.clone()).or_default().push(ScheduledAction {
            id,
            name: name.clone(),
            token: token.clone(),
        });

        let actions = Arc::clone(&self.actions);
        let fired = Arc::clone(&self.fired);
        let label = self.label.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let cancelled = tokio::select! {
                _ = token.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            // Deregister before running so the action may schedule follow-ups
            remove_action(&actions, &key, id);
            if cancelled {
                debug!("[{}] Deferred action {} [{}] for {} cancelled", label, name, id, key);
                return;
            }
            debug!("[{}] Running deferred action {} [{}] for {}", label, name, id, key);
            fired.fetch_add(1, Ordering::Relaxed);
            action.await;
        });
        id
    }

    /// Cancel one action
    pub fn cancel(&self, key: &DialogKey, id: u64) -> bool {
        let mut found = None;
        if let Some(mut entry) = self.actions.get_mut(key) {
            if let Some(pos) = entry.iter().position(|a| a.id == id) {
                found = Some(entry.remove(pos));
            }
        }
        self.actions.remove_if(key, |_, list| list.is_empty());
        match found {
            Some(action) => {
                action.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending action of a dialog; returns how many were pending
    pub fn cancel_all(&self, key: &DialogKey) -> usize {
        match self.actions.remove(key) {
            Some((_, list)) => {
                for action in &list {
                    debug!("[{}] Cancelling {} [{}] for {}", self.label, action.name, action.id, key);
                    action.token.cancel();
                }
                list.len()
            }
            None => 0,
        }
    }

    /// Pending actions of a dialog
    pub fn pending(&self, key: &DialogKey) -> usize {
        self.actions.get(key).map_or(0, |list| list.len())
    }

    /// Pending actions across all dialogs
    pub fn total_pending(&self) -> usize {
        self.actions.iter().map(|entry| entry.value().len()).sum()
    }

    /// Actions that ran so far
    pub fn fired_count(&self) -> usize {
        self.fired.load(Ordering::Relaxed)
    }

    /// Cancel everything, including actions scheduled later
    pub fn shutdown(&self) {
        self.root.cancel();
        self.actions.clear();
    }
}

fn remove_action(actions: &DashMap<DialogKey, Vec<ScheduledAction>>, key: &DialogKey, id: u64) {
    if let Some(mut entry) = actions.get_mut(key) {
        entry.retain(|a| a.id != id);
    }
    actions.remove_if(key, |_, list| list.is_empty());
}
