//! End-to-end engine tests over the actor wiring.
//!
//! Flushes are driven manually unless a test is about the flush timer.

use mdstash_core::{ActionKind, ContainerKey, LocationId, SessionId, Stack};
use mdstash_net::{ActionRequest, ClientMessage, ServerMessage, SlotChange, SyncMessage};
use mdstash_server::{AuditLog, PersistenceConfig, RateLimitConfig, ServerConfig, ServerError, StashServer};
use mdstash_testkit::{drain_messages, drain_syncs, fixture_catalog, FixedProducer, MemoryStore};
use mdstash_world::{ProducerAction, SnapshotKey, SnapshotStore, CONTAINER_SLOT_COUNT, INVENTORY_SIZE};
use std::sync::Arc;
use std::time::Duration;

const KEY: ContainerKey = ContainerKey::new(10, 64, -3);
const CHEST: LocationId = LocationId::Container(KEY);
const S1: SessionId = SessionId(1);
const S2: SessionId = SessionId(2);

fn config() -> ServerConfig {
    ServerConfig {
        flush_interval_ms: 3_600_000,
        max_idle_containers: 0,
        persistence: PersistenceConfig {
            backoff_ms: 1,
            ..PersistenceConfig::default()
        },
        ..ServerConfig::default()
    }
}

fn start(store: &Arc<MemoryStore>, config: ServerConfig) -> StashServer {
    StashServer::start(
        config,
        Arc::new(fixture_catalog()),
        Arc::new(FixedProducer::new([(1, 64), (11, 1)])),
        store.clone(),
        AuditLog::disabled(),
    )
}

fn stocked_store(slots: &[Stack]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert_slots(SnapshotKey::Container(KEY), slots);
    store
}

fn primary(location: LocationId, slot: u16) -> ActionRequest {
    ActionRequest::primary(location, slot)
}

#[tokio::test]
async fn connect_and_open_send_full_snapshots() {
    let store = stocked_store(&[Stack::new(3, 40)]);
    let server = start(&store, config());
    let (mut session, mut rx) = server.connect(S1).await.unwrap();
    session.open(KEY).await.unwrap();
    server.flush().await;

    let syncs = drain_syncs(&mut rx);
    assert_eq!(syncs.len(), 2);
    assert_eq!(syncs[0].location(), LocationId::Inventory);
    let SyncMessage::Full { slots, cursor, .. } = &syncs[1] else {
        panic!("expected full container sync, got {:?}", syncs[1]);
    };
    assert_eq!(slots.len(), CONTAINER_SLOT_COUNT);
    assert_eq!(slots[0], Stack::new(3, 40));
    assert_eq!(*cursor, Stack::EMPTY);
}

#[tokio::test]
async fn forged_action_is_rejected_and_resynced() {
    let store = stocked_store(&[Stack::new(2, 1)]);
    let server = start(&store, config());
    let (mut session, mut rx) = server.connect(S1).await.unwrap();
    session.open(KEY).await.unwrap();
    server.flush().await;
    drain_messages(&mut rx);

    session.action(primary(CHEST, 0)).await.unwrap();
    let forged = ActionRequest {
        quantity: Some(64),
        ..primary(CHEST, 1)
    };
    let err = session.action(forged).await.unwrap_err();
    assert!(matches!(err, ServerError::Validation(_)), "{err}");
    assert!(err.forces_resync());

    let container = server.container(KEY).await.unwrap().unwrap();
    assert_eq!(container.slots()[0], Stack::EMPTY);
    assert_eq!(container.slots()[1], Stack::EMPTY);
    assert_eq!(container.cursor(S1), Some(Stack::new(2, 1)));

    server.flush().await;
    let syncs = drain_syncs(&mut rx);
    assert_eq!(
        syncs,
        vec![SyncMessage::Full {
            location: CHEST,
            slots: vec![Stack::EMPTY; CONTAINER_SLOT_COUNT],
            cursor: Stack::new(2, 1),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn accepted_action_reaches_other_viewer_within_one_interval() {
    let interval = Duration::from_millis(20);
    let store = stocked_store(&[Stack::new(3, 40)]);
    let server = start(
        &store,
        ServerConfig {
            flush_interval_ms: 20,
            ..config()
        },
    );
    let (mut first, mut rx1) = server.connect(S1).await.unwrap();
    let (mut second, mut rx2) = server.connect(S2).await.unwrap();
    first.open(KEY).await.unwrap();
    second.open(KEY).await.unwrap();
    server.flush().await;
    drain_messages(&mut rx1);
    drain_messages(&mut rx2);

    let committed = tokio::time::Instant::now();
    first
        .action(ActionRequest::secondary(CHEST, 0))
        .await
        .unwrap();

    // The paused clock only moves to the next pending timer, so the wait
    // measures ticks rather than wall time.
    let message = rx2.recv().await.unwrap();
    assert!(
        committed.elapsed() <= interval,
        "delta took {:?}",
        committed.elapsed()
    );
    assert_eq!(
        message,
        ServerMessage::Sync(SyncMessage::Delta {
            location: CHEST,
            changes: vec![SlotChange {
                slot: 0,
                stack: Stack::new(3, 20),
            }],
            cursor: None,
        })
    );
}

#[tokio::test]
async fn burst_of_actions_collapses_into_one_message() {
    let store = stocked_store(&[Stack::new(3, 40), Stack::new(3, 10)]);
    let server = start(&store, config());
    let (mut session, mut rx) = server.connect(S1).await.unwrap();
    session.open(KEY).await.unwrap();
    server.flush().await;
    drain_messages(&mut rx);

    // Pick up, put down elsewhere, pick up the second stack.
    session.action(primary(CHEST, 0)).await.unwrap();
    session.action(primary(CHEST, 2)).await.unwrap();
    session.action(primary(CHEST, 1)).await.unwrap();
    server.flush().await;

    let syncs = drain_syncs(&mut rx);
    assert_eq!(syncs.len(), 1);
    let SyncMessage::Delta { changes, cursor, .. } = &syncs[0] else {
        panic!("expected delta, got {:?}", syncs[0]);
    };
    assert_eq!(changes.len(), 3);
    assert_eq!(changes[2].stack, Stack::new(3, 40));
    assert_eq!(*cursor, Some(Stack::new(3, 10)));
}

#[tokio::test]
async fn close_drains_cursor_into_inventory() {
    let store = stocked_store(&[Stack::new(3, 40)]);
    let server = start(&store, config());
    let (mut session, mut rx) = server.connect(S1).await.unwrap();
    session.open(KEY).await.unwrap();
    server.flush().await;
    drain_messages(&mut rx);
    session.action(primary(CHEST, 0)).await.unwrap();

    session.close(KEY).await.unwrap();
    server.flush().await;

    let inventory = server.inventory(S1).await.unwrap();
    assert_eq!(inventory.get(0), Some(Stack::new(3, 40)));
    let container = server.container(KEY).await.unwrap().unwrap();
    assert!(container.slots().iter().all(Stack::is_empty));
    assert!(container.is_evictable());

    let messages = drain_messages(&mut rx);
    assert_eq!(messages.last(), Some(&ServerMessage::CloseAck { key: KEY }));
    assert!(messages.iter().any(|message| matches!(
        message,
        ServerMessage::Sync(SyncMessage::Delta { location: LocationId::Inventory, changes, .. })
            if changes.contains(&SlotChange { slot: 0, stack: Stack::new(3, 40) })
    )));
    assert!(session.open_containers().is_empty());
}

#[tokio::test]
async fn close_with_full_inventory_returns_cursor_to_container() {
    let store = stocked_store(&[Stack::new(3, 40)]);
    let server = start(&store, config());
    let (mut session, _rx) = server.connect(S1).await.unwrap();
    for _ in 0..INVENTORY_SIZE {
        let leftover = server
            .add_item(S1, 11, 1, ProducerAction::Harvest)
            .await
            .unwrap();
        assert_eq!(leftover, 0);
    }

    session.open(KEY).await.unwrap();
    session.action(primary(CHEST, 0)).await.unwrap();
    session.close(KEY).await.unwrap();

    let container = server.container(KEY).await.unwrap().unwrap();
    assert_eq!(container.slots()[0], Stack::new(3, 40));
    assert!(container.overflow().is_empty());
    assert_eq!(server.inventory(S1).await.unwrap().count_item(3), 0);
}

#[tokio::test]
async fn action_on_unopened_container_changes_nothing() {
    let store = stocked_store(&[Stack::new(3, 40)]);
    let server = start(&store, config());
    let (mut session, _rx) = server.connect(S1).await.unwrap();

    let err = session.action(primary(CHEST, 0)).await.unwrap_err();
    assert!(matches!(err, ServerError::UnknownLocation { .. }), "{err}");
    assert!(server.resident_containers().await.unwrap().is_empty());
}

#[tokio::test]
async fn out_of_range_slot_is_refused() {
    let store = Arc::new(MemoryStore::new());
    let server = start(&store, config());
    let (mut session, mut rx) = server.connect(S1).await.unwrap();
    server.flush().await;
    drain_messages(&mut rx);

    let err = session
        .action(primary(LocationId::Inventory, INVENTORY_SIZE as u16))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::SlotOutOfRange { len: INVENTORY_SIZE, .. }), "{err}");
    assert!(err.forces_resync());
    server.flush().await;
    let syncs = drain_syncs(&mut rx);
    assert_eq!(syncs.len(), 1);
    assert!(syncs[0].is_full());
    assert_eq!(syncs[0].location(), LocationId::Inventory);

    let err = session
        .handle(ClientMessage::Action(primary(LocationId::Inventory, 500)))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::InvalidRequest(_)), "{err}");
}

#[tokio::test]
async fn rate_limited_actions_force_full_resync() {
    let store = Arc::new(MemoryStore::new());
    let server = start(
        &store,
        ServerConfig {
            rate_limit: RateLimitConfig {
                window_ms: 60_000,
                max_actions: 2,
            },
            ..config()
        },
    );
    let (mut session, mut rx) = server.connect(S1).await.unwrap();
    server.flush().await;
    drain_messages(&mut rx);

    session.action(primary(LocationId::Inventory, 0)).await.unwrap();
    session.action(primary(LocationId::Inventory, 1)).await.unwrap();
    let err = session
        .action(primary(LocationId::Inventory, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::RateLimited(S1)), "{err}");

    server.flush().await;
    let syncs = drain_syncs(&mut rx);
    assert_eq!(syncs.len(), 1);
    assert!(syncs[0].is_full());
    assert_eq!(syncs[0].location(), LocationId::Inventory);
}

#[tokio::test]
async fn unopened_container_is_never_resynced_to_outsider() {
    let store = stocked_store(&[Stack::new(3, 40)]);
    let server = start(
        &store,
        ServerConfig {
            rate_limit: RateLimitConfig {
                window_ms: 60_000,
                max_actions: 0,
            },
            ..config()
        },
    );
    let (mut owner, _rx1) = server.connect(S1).await.unwrap();
    owner.open(KEY).await.unwrap();
    let (mut outsider, mut rx2) = server.connect(S2).await.unwrap();
    server.flush().await;
    drain_messages(&mut rx2);

    let err = outsider.action(primary(CHEST, 0)).await.unwrap_err();
    assert!(matches!(err, ServerError::UnknownLocation { session: S2, .. }), "{err}");
    let err = outsider
        .handle(ClientMessage::Action(primary(CHEST, 500)))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::UnknownLocation { session: S2, .. }), "{err}");

    server.flush().await;
    assert!(drain_syncs(&mut rx2)
        .iter()
        .all(|sync| sync.location() != CHEST));
}

#[tokio::test]
async fn disconnect_persists_inventory_and_container() {
    let store = stocked_store(&[Stack::new(3, 40)]);
    let server = start(&store, config());
    let (mut session, _rx) = server.connect(S1).await.unwrap();
    session.open(KEY).await.unwrap();
    session.action(primary(CHEST, 0)).await.unwrap();

    session.handle(ClientMessage::Disconnect).await.unwrap();

    let saved = store.get(&SnapshotKey::Inventory(S1)).unwrap();
    let restored = saved.restore(INVENTORY_SIZE, &fixture_catalog());
    assert_eq!(restored.slots[0], Stack::new(3, 40));
    assert!(matches!(
        server.inventory(S1).await,
        Err(ServerError::UnknownSession(S1))
    ));

    server.maintain().await.unwrap();
    assert!(server.resident_containers().await.unwrap().is_empty());
    assert!(store
        .get(&SnapshotKey::Container(KEY))
        .unwrap()
        .slots
        .is_empty());
}

#[tokio::test]
async fn untouched_inventory_never_erases_unreadable_items() {
    let store = Arc::new(MemoryStore::new());
    // Item 200 is unknown to the catalog, so the restore drops it.
    store.insert_slots(SnapshotKey::Inventory(S1), &[Stack::new(200, 5)]);
    let stored = store.get(&SnapshotKey::Inventory(S1));
    let server = start(&store, config());

    let (mut session, _rx) = server.connect(S1).await.unwrap();
    assert!(server.inventory(S1).await.unwrap().slots().iter().all(Stack::is_empty));
    session.disconnect().await;

    assert_eq!(store.save_calls(), 0);
    assert_eq!(store.get(&SnapshotKey::Inventory(S1)), stored);
}

#[tokio::test]
async fn dropped_session_is_torn_down() {
    let store = Arc::new(MemoryStore::new());
    let server = start(&store, config());
    let (session, _rx) = server.connect(S1).await.unwrap();
    server
        .add_item(S1, 1, 10, ProducerAction::Pickup { entity_id: 9 })
        .await
        .unwrap();

    drop(session);

    for _ in 0..200 {
        if store.get(&SnapshotKey::Inventory(S1)).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let saved = store.get(&SnapshotKey::Inventory(S1)).unwrap();
    assert_eq!(saved.slots.len(), 1);
    assert_eq!(saved.slots[0].count, 10);
}

#[tokio::test]
async fn failed_inventory_load_fails_connect() {
    let store = Arc::new(MemoryStore::new());
    store.fail_loads(3);
    let server = start(&store, config());

    assert!(matches!(
        server.connect(S1).await,
        Err(ServerError::Persistence { .. })
    ));
    assert_eq!(store.load_calls(), 3);

    assert!(server.connect(S1).await.is_ok());
    assert_eq!(store.load_calls(), 4);
}

#[tokio::test]
async fn load_retry_recovers_from_transient_failure() {
    let store = stocked_store(&[Stack::new(5, 12)]);
    let server = start(&store, config());
    let (mut session, _rx) = server.connect(S1).await.unwrap();
    store.fail_loads(2);

    session.open(KEY).await.unwrap();
    let container = server.container(KEY).await.unwrap().unwrap();
    assert_eq!(container.slots()[0], Stack::new(5, 12));
}

#[tokio::test]
async fn failed_container_load_fails_open_then_recovers() {
    let store = stocked_store(&[Stack::new(5, 12)]);
    let server = start(&store, config());
    let (mut session, _rx) = server.connect(S1).await.unwrap();
    store.fail_loads(3);

    let err = session.open(KEY).await.unwrap_err();
    assert!(matches!(err, ServerError::Persistence { .. }), "{err}");
    assert!(session.open_containers().is_empty());

    session.open(KEY).await.unwrap();
    assert_eq!(session.open_containers(), vec![KEY]);
    let container = server.container(KEY).await.unwrap().unwrap();
    assert_eq!(container.slots()[0], Stack::new(5, 12));
}

#[tokio::test]
async fn failed_save_keeps_container_resident_until_retry() {
    let store = stocked_store(&[Stack::new(3, 40)]);
    let server = start(&store, config());
    let (mut session, _rx) = server.connect(S1).await.unwrap();
    session.open(KEY).await.unwrap();
    session
        .action(ActionRequest::secondary(CHEST, 0))
        .await
        .unwrap();
    session.action(primary(CHEST, 1)).await.unwrap();
    session.close(KEY).await.unwrap();

    store.fail_saves(3);
    server.maintain().await.unwrap();
    assert_eq!(server.resident_containers().await.unwrap(), vec![KEY]);

    server.maintain().await.unwrap();
    assert!(server.resident_containers().await.unwrap().is_empty());
    let saved = store.get(&SnapshotKey::Container(KEY)).unwrap();
    let restored = saved.restore(CONTAINER_SLOT_COUNT, &fixture_catalog());
    assert_eq!(restored.slots[0], Stack::new(3, 20));
    assert_eq!(restored.slots[1], Stack::new(3, 20));
}

#[tokio::test]
async fn failed_final_save_is_retried_by_maintenance() {
    let store = Arc::new(MemoryStore::new());
    let server = start(&store, config());
    let (mut session, _rx) = server.connect(S1).await.unwrap();
    server
        .add_item(S1, 1, 10, ProducerAction::Harvest)
        .await
        .unwrap();

    store.fail_saves(3);
    session.disconnect().await;
    assert_eq!(store.save_calls(), 3);
    assert!(store.get(&SnapshotKey::Inventory(S1)).is_none());

    server.maintain().await.unwrap();
    let saved = store.get(&SnapshotKey::Inventory(S1)).unwrap();
    let restored = saved.restore(INVENTORY_SIZE, &fixture_catalog());
    assert_eq!(restored.slots[0], Stack::new(1, 10));
}

#[tokio::test]
async fn reconnect_picks_up_unsaved_inventory() {
    let store = Arc::new(MemoryStore::new());
    let server = start(&store, config());
    let (mut session, _rx) = server.connect(S1).await.unwrap();
    server
        .add_item(S1, 1, 10, ProducerAction::Harvest)
        .await
        .unwrap();
    store.fail_saves(3);
    session.disconnect().await;

    let (mut session, _rx) = server.connect(S1).await.unwrap();
    assert_eq!(server.inventory(S1).await.unwrap().count_item(1), 10);
    session.disconnect().await;
    let saved = store.get(&SnapshotKey::Inventory(S1)).unwrap();
    assert_eq!(saved.slots[0].count, 10);
}

#[tokio::test]
async fn producer_surface_respects_grants() {
    let store = Arc::new(MemoryStore::new());
    let server = start(&store, config());
    let (_session, _rx) = server.connect(S1).await.unwrap();

    let err = server
        .add_item(S1, 1, 100, ProducerAction::Harvest)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Validation(_)), "{err}");
    assert_eq!(server.add_item(S1, 1, 50, ProducerAction::Harvest).await.unwrap(), 0);

    assert!(!server.remove_item(S1, 1, 60).await.unwrap());
    assert!(server.remove_item(S1, 1, 50).await.unwrap());
    assert!(server.inventory(S1).await.unwrap().is_empty());

    assert!(matches!(
        server.remove_item(S2, 1, 1).await,
        Err(ServerError::UnknownSession(S2))
    ));
}

#[tokio::test]
async fn inventory_survives_reconnect_through_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SnapshotStore::new(dir.path()).unwrap());
    let server = StashServer::start(
        config(),
        Arc::new(fixture_catalog()),
        Arc::new(FixedProducer::new([(1, 64)])),
        store,
        AuditLog::disabled(),
    );

    let (mut session, _rx) = server.connect(S1).await.unwrap();
    server
        .add_item(S1, 1, 10, ProducerAction::Harvest)
        .await
        .unwrap();
    session
        .action(ActionRequest {
            location: LocationId::Inventory,
            slot: 0,
            kind: ActionKind::Secondary,
            quantity: None,
        })
        .await
        .unwrap();
    session.disconnect().await;

    let (_session, _rx) = server.connect(S1).await.unwrap();
    let inventory = server.inventory(S1).await.unwrap();
    assert_eq!(inventory.count_item(1), 10);
    assert_eq!(inventory.cursor(), Stack::EMPTY);
}
