use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;
use crate::cache::{dialog_state_key, ownership_key, transaction_key, CacheAdapter, InMemoryCache};
use crate::codec::DialogSnapshot;
use crate::config::{HaConfig, ReplicationStrategy, RetryPolicy};
use crate::dialog::{DialogKey, DialogState, LiveDialog, SubscriptionState};
use crate::engine::TransportContext;
use crate::errors::HaError;
use crate::events::DialogLifecycleEvent;
use crate::message::{Method, SipUri};
use crate::ownership::{Clock, KeyedLocks, LeaseManager, ManualClock, NodeId};
use crate::transaction::{TransactionSnapshot, TransactionState};

struct Node {
    cache: Arc<InMemoryCache>,
    store: Arc<CacheAdapter>,
    leases: Arc<LeaseManager>,
    replication: Arc<ReplicationManager>,
}

fn node(cache: Arc<InMemoryCache>, clock: Arc<ManualClock>, config: HaConfig) -> Node {
    let store = Arc::new(CacheAdapter::new(cache.clone(), Duration::from_millis(500), RetryPolicy::none()));
    let locks = Arc::new(KeyedLocks::new());
    let leases = Arc::new(LeaseManager::new(
        config.node_id.clone(),
        store.clone(),
        clock,
        locks.clone(),
        config.lease_duration,
        config.lease_safety_margin,
    ));
    let replication = Arc::new(ReplicationManager::new(&config, store.clone(), leases.clone(), locks));
    Node { cache, store, leases, replication }
}

fn single_node(config: HaConfig) -> Node {
    node(Arc::new(InMemoryCache::new()), Arc::new(ManualClock::default()), config)
}

fn key() -> DialogKey {
    DialogKey::new("call-1", "4321", "12345")
}

fn dialog(state: DialogState) -> LiveDialog {
    let snapshot = DialogSnapshot {
        call_id: "call-1".to_string(),
        local_tag: "4321".to_string(),
        remote_tag: "12345".to_string(),
        state,
        local_seq: 1,
        remote_seq: 1,
        route_set: vec!["sip:127.0.0.1:5050;lr".to_string()],
        local_uri: "sip:LittleGuy@there.com".to_string(),
        remote_uri: "sip:BigGuy@here.com".to_string(),
        remote_target: "sip:BigGuy@127.0.0.1:5060".to_string(),
        is_initiator: false,
        subscription_state: SubscriptionState::None,
        application_data: BTreeMap::new(),
        version: 0,
    };
    let transport = TransportContext::new(NodeId::new("node-a"), SipUri::new("127.0.0.1", Some(5070)));
    LiveDialog::from_snapshot(&snapshot, &transport).unwrap()
}

fn created(state: DialogState) -> DialogLifecycleEvent {
    DialogLifecycleEvent::DialogCreated { dialog: dialog(state) }
}

fn changed(dialog: LiveDialog) -> DialogLifecycleEvent {
    DialogLifecycleEvent::DialogStateChanged { dialog }
}

fn terminated() -> DialogLifecycleEvent {
    DialogLifecycleEvent::DialogTerminated { dialog: dialog(DialogState::Terminated), reason: "BYE".to_string() }
}

async fn stored(node: &Node) -> Option<DialogSnapshot> {
    let entry = node.store.get(&dialog_state_key(&key())).await.unwrap()?;
    Some(node.replication.codec().decode(&key(), &entry.value).unwrap())
}

#[tokio::test]
async fn test_created_dialog_is_leased_and_written() {
    let a = single_node(HaConfig::new("node-a"));

    let outcome = a.replication.dispatch(created(DialogState::Confirmed)).await.unwrap();

    assert_eq!(outcome, ReplicationOutcome::Written { version: 1 });
    assert!(a.leases.holds_valid_lease(&key()));
    assert_eq!(stored(&a).await.unwrap().version, 1);
    assert_eq!(a.replication.version_of(&key()), Some(1));
}

#[tokio::test]
async fn test_updates_bump_the_version() {
    let a = single_node(HaConfig::new("node-a"));
    a.replication.dispatch(created(DialogState::Confirmed)).await.unwrap();

    let mut live = dialog(DialogState::Confirmed);
    live.create_request(Method::Options);
    let outcome = a.replication.dispatch(changed(live)).await.unwrap();

    assert_eq!(outcome, ReplicationOutcome::Written { version: 2 });
    let snapshot = stored(&a).await.unwrap();
    assert_eq!(snapshot.local_seq, 2);
    assert_eq!(snapshot.version, 2);
}

#[tokio::test]
async fn test_confirmed_strategy_skips_early_dialogs() {
    let a = single_node(HaConfig::new("node-a"));

    let outcome = a.replication.dispatch(created(DialogState::Early)).await.unwrap();
    assert_eq!(outcome, ReplicationOutcome::Skipped);
    assert!(stored(&a).await.is_none());
    // The lease is claimed regardless
    assert!(a.leases.holds_valid_lease(&key()));

    let outcome = a.replication.dispatch(changed(dialog(DialogState::Confirmed))).await.unwrap();
    assert_eq!(outcome, ReplicationOutcome::Written { version: 1 });
    assert_eq!(a.replication.stats().skipped, 1);
}

#[tokio::test]
async fn test_early_strategy_writes_early_dialogs() {
    let config = HaConfig::new("node-a").with_replication_strategy(ReplicationStrategy::EarlyDialog);
    let a = single_node(config);

    let outcome = a.replication.dispatch(created(DialogState::Early)).await.unwrap();
    assert_eq!(outcome, ReplicationOutcome::Written { version: 1 });
    assert_eq!(stored(&a).await.unwrap().state, DialogState::Early);
}

#[tokio::test]
async fn test_update_without_lease_is_rejected() {
    let a = single_node(HaConfig::new("node-a"));

    let err = a.replication.dispatch(changed(dialog(DialogState::Confirmed))).await.unwrap_err();
    assert!(matches!(err, HaError::NotOwner { .. }));
    assert!(stored(&a).await.is_none());
}

#[tokio::test]
async fn test_remote_terminal_state_supersedes_stale_write() {
    let cache = Arc::new(InMemoryCache::new());
    let clock = Arc::new(ManualClock::default());
    let a = node(cache.clone(), clock.clone(), HaConfig::new("node-a"));
    let b = node(cache, clock.clone(), HaConfig::new("node-b"));

    a.replication.dispatch(created(DialogState::Confirmed)).await.unwrap();

    // A goes quiet; B takes over and ends the dialog
    clock.advance(Duration::from_secs(31));
    b.leases.acquire(&key()).await.unwrap();
    b.replication.seed_version(&key(), 1);
    let outcome = b.replication.dispatch(terminated()).await.unwrap();
    assert_eq!(outcome, ReplicationOutcome::Written { version: 2 });

    // A still believes it owns the dialog within its own clock skew
    clock.set(ManualClock::default().now_ms());
    let outcome = a.replication.dispatch(changed(dialog(DialogState::Confirmed))).await.unwrap();

    assert_eq!(outcome, ReplicationOutcome::Superseded);
    assert_eq!(stored(&a).await.unwrap().state, DialogState::Terminated);
    assert!(a.replication.is_terminated(&key()));
    let stats = a.replication.stats();
    assert_eq!(stats.conflicts, 1);
    assert_eq!(stats.superseded, 1);
}

#[tokio::test]
async fn test_conflict_with_live_state_is_merged() {
    let a = single_node(HaConfig::new("node-a"));
    a.replication.dispatch(created(DialogState::Confirmed)).await.unwrap();

    // Another writer advanced the snapshot behind our back
    let mut theirs = stored(&a).await.unwrap();
    theirs.remote_seq = 9;
    theirs.version = 2;
    let bytes = a.replication.codec().encode(&theirs).unwrap();
    a.store.compare_and_swap(&dialog_state_key(&key()), Some(1), bytes, None).await.unwrap();

    let mut live = dialog(DialogState::Confirmed);
    live.create_request(Method::Options);
    let outcome = a.replication.dispatch(changed(live)).await.unwrap();

    assert_eq!(outcome, ReplicationOutcome::Written { version: 3 });
    let merged = stored(&a).await.unwrap();
    assert_eq!((merged.local_seq, merged.remote_seq), (2, 9));
}

#[tokio::test]
async fn test_outage_parks_and_resync_flushes() {
    let a = single_node(HaConfig::new("node-a"));
    a.replication.dispatch(created(DialogState::Confirmed)).await.unwrap();

    a.cache.set_available(false);
    let mut live = dialog(DialogState::Confirmed);
    live.create_request(Method::Options);
    let outcome = a.replication.dispatch(changed(live)).await.unwrap();
    assert_eq!(outcome, ReplicationOutcome::Degraded);
    assert_eq!(a.replication.pending_count(), 1);
    assert_eq!(a.replication.resync_pending().await, 0);

    a.cache.set_available(true);
    assert_eq!(a.replication.resync_pending().await, 1);
    assert_eq!(a.replication.pending_count(), 0);
    assert_eq!(stored(&a).await.unwrap().local_seq, 2);
    assert_eq!(a.replication.stats().resynced, 1);
}

#[tokio::test]
async fn test_dialog_created_during_outage_gets_lease_on_resync() {
    let a = single_node(HaConfig::new("node-a"));
    a.cache.set_available(false);

    let outcome = a.replication.dispatch(created(DialogState::Confirmed)).await.unwrap();
    assert_eq!(outcome, ReplicationOutcome::Degraded);
    assert!(!a.leases.holds_valid_lease(&key()));

    a.cache.set_available(true);
    assert_eq!(a.replication.resync_pending().await, 1);
    assert!(a.leases.holds_valid_lease(&key()));
    assert_eq!(stored(&a).await.unwrap().version, 1);
}

#[tokio::test(start_paused = true)]
async fn test_terminated_dialog_is_purged_after_grace() {
    let config = HaConfig::new("node-a").with_termination_grace_period(Duration::from_secs(32));
    let a = single_node(config);
    a.replication.dispatch(created(DialogState::Confirmed)).await.unwrap();

    let outcome = a.replication.dispatch(terminated()).await.unwrap();
    assert_eq!(outcome, ReplicationOutcome::Written { version: 2 });
    assert_eq!(a.replication.pending_purges(), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(stored(&a).await.unwrap().state, DialogState::Terminated);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(stored(&a).await.is_none());
    assert!(a.store.get(&ownership_key(&key())).await.unwrap().is_none());
    assert_eq!(a.replication.version_of(&key()), None);
    assert_eq!(a.replication.stats().purged, 1);
}

#[tokio::test]
async fn test_second_termination_is_ignored() {
    let a = single_node(HaConfig::new("node-a"));
    a.replication.dispatch(created(DialogState::Confirmed)).await.unwrap();

    a.replication.dispatch(terminated()).await.unwrap();
    let outcome = a.replication.dispatch(terminated()).await.unwrap();
    assert_eq!(outcome, ReplicationOutcome::Superseded);
    assert_eq!(a.replication.pending_purges(), 1);
}

#[tokio::test]
async fn test_transactions_are_written_and_removed() {
    let a = single_node(HaConfig::new("node-a"));
    a.replication.dispatch(created(DialogState::Confirmed)).await.unwrap();

    let mut transaction = TransactionSnapshot::new("z9hG4bK-1", &Method::Bye, TransactionState::Proceeding);
    transaction.dialog = Some(key());
    a.replication
        .dispatch(DialogLifecycleEvent::TransactionStateChanged { transaction: transaction.clone() })
        .await
        .unwrap();
    assert_eq!(a.replication.fetch_transaction("z9hG4bK-1").await.unwrap(), Some(transaction.clone()));

    let outcome = a
        .replication
        .dispatch(DialogLifecycleEvent::TransactionTerminated { transaction })
        .await
        .unwrap();
    assert_eq!(outcome, ReplicationOutcome::Removed);
    assert!(a.store.get(&transaction_key("z9hG4bK-1")).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_expired_snapshot_of_live_dialog_is_written_again() {
    let a = single_node(HaConfig::new("node-a").with_snapshot_ttl(Duration::from_secs(60)));
    a.replication.dispatch(created(DialogState::Confirmed)).await.unwrap();

    // A long call with no traffic outlives the snapshot TTL
    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(stored(&a).await.is_none());

    let mut live = dialog(DialogState::Confirmed);
    live.create_request(Method::Options);
    let outcome = a.replication.dispatch(changed(live.clone())).await.unwrap();

    assert_eq!(outcome, ReplicationOutcome::Written { version: 1 });
    assert!(!a.replication.is_terminated(&key()));
    let snapshot = stored(&a).await.unwrap();
    assert_eq!(snapshot.state, DialogState::Confirmed);
    assert_eq!(snapshot.local_seq, 2);

    live.create_request(Method::Options);
    let outcome = a.replication.dispatch(changed(live)).await.unwrap();
    assert_eq!(outcome, ReplicationOutcome::Written { version: 2 });
    assert_eq!(stored(&a).await.unwrap().local_seq, 3);
}

#[tokio::test]
async fn test_termination_without_lease_leaves_no_tombstone() {
    let a = single_node(HaConfig::new("node-a"));

    let err = a.replication.dispatch(terminated()).await.unwrap_err();
    assert!(matches!(err, HaError::NotOwner { .. }));
    assert!(!a.replication.is_terminated(&key()));
    assert_eq!(a.replication.pending_purges(), 0);

    // Once owned, the same termination is accepted; never replicated, so not written
    a.leases.acquire(&key()).await.unwrap();
    let outcome = a.replication.dispatch(terminated()).await.unwrap();
    assert_eq!(outcome, ReplicationOutcome::Skipped);
    assert!(a.replication.is_terminated(&key()));
    assert_eq!(a.replication.pending_purges(), 1);
}
