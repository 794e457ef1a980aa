//! Multi-hub replication over the in-process bus.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use realm_core::config::ChatConfig;
use realm_hub::{
    Connection, Delivery, HubError, LocalBus, MemorySnapshotStore, MessagingHub, SyncManager,
    SyncOptions, SyncState,
};
use realm_types::{ChatMessage, PlayerId, Principal};

fn options() -> SyncOptions {
    SyncOptions {
        start_timeout: Duration::from_millis(500),
        retry_attempts: 1,
        retry_backoff: Duration::from_millis(5),
        rejoin_grace: Duration::from_secs(60),
    }
}

fn node(
    bus: &LocalBus,
    journal: &Arc<MemorySnapshotStore>,
) -> (Arc<MessagingHub>, SyncManager<LocalBus, MemorySnapshotStore>) {
    let hub = Arc::new(MessagingHub::new(ChatConfig::default()));
    let sync = SyncManager::new(Arc::clone(&hub), bus.clone(), Arc::clone(journal), options());
    (hub, sync)
}

/// Next chat message delivered to `conn`, skipping presence updates.
async fn next_message(conn: &mut Connection) -> Option<ChatMessage> {
    let wait = async {
        while let Some(delivery) = conn.deliveries.recv().await {
            if let Delivery::Message { message } = delivery {
                return Some(message);
            }
        }
        None
    };
    tokio::time::timeout(Duration::from_millis(500), wait)
        .await
        .ok()
        .flatten()
}

/// Poll `check` until it holds or a second passes.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn message_on_one_hub_reaches_member_on_another() {
    let bus = LocalBus::new();
    let journal = Arc::new(MemorySnapshotStore::new());
    let (hub_a, sync_a) = node(&bus, &journal);
    let (hub_b, sync_b) = node(&bus, &journal);
    let now = Utc::now();

    let alice = Principal::new(PlayerId::new(), "alice");
    let bob = Principal::new(PlayerId::new(), "bob");
    let _alice_conn = hub_a.connect(alice.clone(), now);
    let mut bob_conn = hub_b.connect(bob.clone(), now);
    hub_a.join_channel(&alice, "global", now).unwrap();
    hub_b.join_channel(&bob, "global", now).unwrap();

    sync_a.start().await.unwrap();
    sync_b.start().await.unwrap();

    let sent = hub_a
        .send_message(&alice, "global", "hello from A", Utc::now())
        .unwrap();
    let received = next_message(&mut bob_conn).await.expect("message replicated");
    assert_eq!(received, sent);
    assert_eq!(hub_b.get_recent_messages("global", 10), vec![sent]);

    // Presence replicates too.
    let carol = Principal::new(PlayerId::new(), "carol");
    let _carol_conn = hub_b.connect(carol.clone(), Utc::now());
    hub_b.join_channel(&carol, "global", Utc::now()).unwrap();
    assert!(eventually(|| hub_a.get_online_users("global").contains(&String::from("carol"))).await);

    sync_a.stop().await;
    sync_b.stop().await;
}

#[tokio::test]
async fn stopped_hub_no_longer_receives() {
    let bus = LocalBus::new();
    let journal = Arc::new(MemorySnapshotStore::new());
    let (hub_a, sync_a) = node(&bus, &journal);
    let (hub_b, sync_b) = node(&bus, &journal);
    let now = Utc::now();

    let alice = Principal::new(PlayerId::new(), "alice");
    let bob = Principal::new(PlayerId::new(), "bob");
    hub_a.join_channel(&alice, "world:1", now).unwrap();
    let _alice_conn = hub_a.connect(alice.clone(), now);
    let mut bob_conn = hub_b.connect(bob.clone(), now);
    hub_b.join_channel(&bob, "world:1", now).unwrap();

    sync_a.start().await.unwrap();
    sync_b.start().await.unwrap();
    sync_b.stop().await;
    assert_eq!(sync_b.state(), SyncState::Stopped);

    hub_a.send_message(&alice, "world:1", "anyone?", now).unwrap();
    assert!(next_message(&mut bob_conn).await.is_none());
    sync_a.stop().await;
}

#[tokio::test]
async fn restarted_hub_rehydrates_from_journal() {
    let bus = LocalBus::new();
    let journal = Arc::new(MemorySnapshotStore::new());
    let (hub_a, sync_a) = node(&bus, &journal);
    let now = Utc::now();

    sync_a.start().await.unwrap();
    let alice = Principal::new(PlayerId::new(), "alice");
    hub_a.join_channel(&alice, "alliance:3", now).unwrap();
    hub_a.send_message(&alice, "alliance:3", "regroup", now).unwrap();
    hub_a.ban_user("mallory", "alliance:3", None, now).unwrap();
    assert!(eventually(|| journal.snapshots().iter().any(|s| !s.bans.is_empty())).await);
    sync_a.stop().await;

    let (hub_b, sync_b) = node(&bus, &journal);
    sync_b.start().await.unwrap();
    assert_eq!(hub_b.get_online_users("alliance:3"), vec!["alice"]);
    assert_eq!(hub_b.get_recent_messages("alliance:3", 10)[0].text, "regroup");
    let mallory = Principal::new(PlayerId::new(), "mallory");
    assert!(matches!(
        hub_b.join_channel(&mallory, "alliance:3", Utc::now()),
        Err(HubError::Banned { .. })
    ));
    sync_b.stop().await;
}

#[tokio::test]
async fn reconnecting_after_restart_resumes_delivery() {
    let bus = LocalBus::new();
    let journal = Arc::new(MemorySnapshotStore::new());
    let alice = Principal::new(PlayerId::new(), "alice");
    let bob = Principal::new(PlayerId::new(), "bob");

    // First life of hub A: alice joins global, then the process dies.
    let (hub_a, sync_a) = node(&bus, &journal);
    sync_a.start().await.unwrap();
    let _old_conn = hub_a.connect(alice.clone(), Utc::now());
    hub_a.join_channel(&alice, "global", Utc::now()).unwrap();
    assert!(eventually(|| journal.snapshots().iter().any(|s| s.name == "global")).await);
    sync_a.stop().await;

    let (hub_b, sync_b) = node(&bus, &journal);
    let mut bob_conn = hub_b.connect(bob.clone(), Utc::now());
    hub_b.join_channel(&bob, "global", Utc::now()).unwrap();
    sync_b.start().await.unwrap();

    // Second life: global is restored but nobody here is connected yet.
    let (hub_a, sync_a) = node(&bus, &journal);
    sync_a.start().await.unwrap();
    assert_eq!(hub_a.get_online_users("global"), vec!["alice"]);
    let mut alice_conn = hub_a.connect(alice.clone(), Utc::now());
    assert!(!hub_a.join_channel(&alice, "global", Utc::now()).unwrap());

    hub_a.send_message(&alice, "global", "back", Utc::now()).unwrap();
    assert_eq!(next_message(&mut bob_conn).await.expect("outbound works").text, "back");
    assert_eq!(next_message(&mut alice_conn).await.unwrap().text, "back");

    hub_b
        .send_message(&bob, "global", "welcome back", Utc::now())
        .unwrap();
    let received = next_message(&mut alice_conn).await.expect("inbound resubscribed");
    assert_eq!(received.text, "welcome back");

    sync_a.stop().await;
    sync_b.stop().await;
}

#[tokio::test]
async fn unreachable_broker_degrades_to_local_delivery() {
    let bus = LocalBus::new();
    bus.set_stalled(true);
    let journal = Arc::new(MemorySnapshotStore::new());
    let (hub, sync) = node(&bus, &journal);

    let err = sync.start().await.unwrap_err();
    assert!(matches!(err, HubError::SyncStartTimeout(_)));
    assert_eq!(sync.state(), SyncState::Stopped);

    let now = Utc::now();
    let alice = Principal::new(PlayerId::new(), "alice");
    let bob = Principal::new(PlayerId::new(), "bob");
    let _alice_conn = hub.connect(alice.clone(), now);
    let mut bob_conn = hub.connect(bob.clone(), now);
    hub.join_channel(&alice, "global", now).unwrap();
    hub.join_channel(&bob, "global", now).unwrap();
    hub.send_message(&alice, "global", "still here", now).unwrap();

    assert_eq!(next_message(&mut bob_conn).await.unwrap().text, "still here");
    sync.stop().await;
}
