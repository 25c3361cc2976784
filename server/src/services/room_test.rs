use super::*;

use serde_json::json;
use tokio::time::{Duration, sleep};
use wire::RoomMessage;

use crate::services::persistence::memory::MemoryStore;
use crate::services::store::RETENTION_MS;

// Valid protobuf envelope whose kind (42) is out of range: field 1, varint 42.
const UNKNOWN_KIND_BYTES: &[u8] = &[0x08, 0x2A];

fn conn() -> (Uuid, mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(32);
    (Uuid::new_v4(), tx, rx)
}

fn recv_message(rx: &mut mpsc::Receiver<Bytes>) -> RoomMessage {
    let bytes = rx.try_recv().expect("expected a queued frame");
    wire::decode_message(&bytes).expect("frame should decode")
}

fn assert_no_frame(rx: &mut mpsc::Receiver<Bytes>) {
    assert!(rx.try_recv().is_err(), "expected no queued frame");
}

fn canvas_update_bytes(elements: serde_json::Value) -> Bytes {
    Bytes::from(wire::encode_message(&RoomMessage::CanvasUpdate {
        elements,
        app_state: json!({"zoom": 1}),
        files: json!({}),
    }))
}

async fn empty_room(name: &str) -> (Room, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let room = Room::hydrate(name.to_owned(), store.clone()).await;
    (room, store)
}

async fn wait_for_store<F>(store: &MemoryStore, room: &str, mut check: F)
where
    F: FnMut(&wire::RoomSnapshot) -> bool,
{
    for _ in 0..100 {
        if store.stored(room).as_ref().is_some_and(&mut check) {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("stored snapshot did not reach expected shape in time");
}

// =============================================================================
// ATTACH / DETACH
// =============================================================================

#[tokio::test]
async fn first_attach_gets_init_with_null_state() {
    let (mut room, _store) = empty_room("demo").await;
    let (id, tx, mut rx) = conn();

    room.attach(id, tx);

    let RoomMessage::Init { state, active_users } = recv_message(&mut rx) else {
        panic!("expected init");
    };
    assert!(state.is_none(), "a never-updated room presents as null state");
    assert_eq!(active_users, 1);
    assert_no_frame(&mut rx);
}

#[tokio::test]
async fn second_attach_gets_state_and_peer_gets_user_joined() {
    let (mut room, _store) = empty_room("demo").await;
    let (id_a, tx_a, mut rx_a) = conn();
    room.attach(id_a, tx_a);
    let _ = recv_message(&mut rx_a); // init

    room.inbound(id_a, canvas_update_bytes(json!([{"type": "rectangle"}])));

    let (id_b, tx_b, mut rx_b) = conn();
    room.attach(id_b, tx_b);

    let RoomMessage::Init { state, active_users } = recv_message(&mut rx_b) else {
        panic!("expected init");
    };
    assert_eq!(active_users, 2);
    let state = state.expect("state should be present after an update");
    assert_eq!(state.elements, json!([{"type": "rectangle"}]));

    let RoomMessage::UserJoined { user_id, active_users } = recv_message(&mut rx_a) else {
        panic!("expected user-joined");
    };
    assert_eq!(user_id, id_b.to_string());
    assert_eq!(active_users, 2);
}

#[tokio::test]
async fn detach_broadcasts_user_left_to_the_remainder() {
    let (mut room, _store) = empty_room("demo").await;
    let (id_a, tx_a, mut rx_a) = conn();
    let (id_b, tx_b, mut rx_b) = conn();
    room.attach(id_a, tx_a);
    room.attach(id_b, tx_b);
    let _ = recv_message(&mut rx_a); // init
    let _ = recv_message(&mut rx_a); // user-joined for b
    let _ = recv_message(&mut rx_b); // init

    room.detach(id_b);

    let RoomMessage::UserLeft { user_id, active_users } = recv_message(&mut rx_a) else {
        panic!("expected user-left");
    };
    assert_eq!(user_id, id_b.to_string());
    assert_eq!(active_users, 1);

    // Detaching an unknown connection announces nothing.
    room.detach(Uuid::new_v4());
    assert_no_frame(&mut rx_a);
}

// =============================================================================
// BROADCAST
// =============================================================================

#[tokio::test]
async fn sender_never_receives_its_own_update() {
    let (mut room, _store) = empty_room("demo").await;
    let (id_a, tx_a, mut rx_a) = conn();
    let (id_b, tx_b, mut rx_b) = conn();
    room.attach(id_a, tx_a);
    room.attach(id_b, tx_b);
    let _ = recv_message(&mut rx_a);
    let _ = recv_message(&mut rx_a);
    let _ = recv_message(&mut rx_b);

    let update = canvas_update_bytes(json!([{"type": "arrow"}]));
    room.inbound(id_a, update.clone());

    // Peer gets the identical bytes; the sender gets nothing back.
    let relayed = rx_b.try_recv().expect("peer should receive the relay");
    assert_eq!(relayed, update);
    assert_no_frame(&mut rx_a);
}

#[tokio::test]
async fn unknown_kinds_are_relayed_but_never_applied() {
    let (mut room, _store) = empty_room("demo").await;
    let (id_a, tx_a, mut rx_a) = conn();
    let (id_b, tx_b, mut rx_b) = conn();
    room.attach(id_a, tx_a);
    room.attach(id_b, tx_b);
    let _ = recv_message(&mut rx_a);
    let _ = recv_message(&mut rx_a);
    let _ = recv_message(&mut rx_b);

    room.inbound(id_a, Bytes::from_static(UNKNOWN_KIND_BYTES));

    let relayed = rx_b.try_recv().expect("unknown kinds still relay");
    assert_eq!(relayed, Bytes::from_static(UNKNOWN_KIND_BYTES));
    assert_eq!(room.snapshot.elements, json!([]));
    assert_eq!(room.snapshot.created_at, None);
}

#[tokio::test]
async fn malformed_bytes_are_dropped_without_a_relay() {
    let (mut room, _store) = empty_room("demo").await;
    let (id_a, tx_a, _rx_a) = conn();
    let (id_b, tx_b, mut rx_b) = conn();
    room.attach(id_a, tx_a);
    room.attach(id_b, tx_b);
    let _ = recv_message(&mut rx_b);

    room.inbound(id_a, Bytes::from_static(&[0xff, 0x00, 0x01]));

    assert_no_frame(&mut rx_b);
    assert_eq!(room.snapshot.created_at, None);
}

#[tokio::test]
async fn server_origin_kinds_from_a_client_mutate_nothing() {
    let (mut room, _store) = empty_room("demo").await;
    let (id_a, tx_a, _rx_a) = conn();
    let (id_b, tx_b, mut rx_b) = conn();
    room.attach(id_a, tx_a);
    room.attach(id_b, tx_b);
    let _ = recv_message(&mut rx_b);

    let spoofed = Bytes::from(wire::encode_message(&RoomMessage::UserJoined {
        user_id: "impostor".into(),
        active_users: 99,
    }));
    room.inbound(id_a, spoofed.clone());

    // Relayed (the relay is unconditional for valid envelopes), not applied.
    assert_eq!(rx_b.try_recv().expect("relay"), spoofed);
    assert_eq!(room.snapshot.created_at, None);
    assert_eq!(room.registry.count(), 2);
}

// =============================================================================
// STATE + PERSISTENCE
// =============================================================================

#[tokio::test]
async fn updates_reach_the_durable_store() {
    let (mut room, store) = empty_room("demo").await;
    let (id_a, tx_a, _rx_a) = conn();
    room.attach(id_a, tx_a);

    room.inbound(id_a, canvas_update_bytes(json!([{"type": "rectangle"}])));

    wait_for_store(&store, "demo", |s| {
        s.created_at.is_some() && s.elements == json!([{"type": "rectangle"}])
    })
    .await;
}

#[tokio::test]
async fn a_failed_write_leaves_the_room_serving() {
    let (mut room, store) = empty_room("demo").await;
    store.fail_writes(true);

    let (id_a, tx_a, _rx_a) = conn();
    room.attach(id_a, tx_a);
    room.inbound(id_a, canvas_update_bytes(json!([{"type": "rectangle"}])));
    sleep(Duration::from_millis(50)).await;

    // Nothing durable, but in-memory stays authoritative and new attaches
    // still see the update.
    assert!(store.stored("demo").is_none());
    let (id_b, tx_b, mut rx_b) = conn();
    room.attach(id_b, tx_b);
    let RoomMessage::Init { state, .. } = recv_message(&mut rx_b) else {
        panic!("expected init");
    };
    assert_eq!(state.expect("state").elements, json!([{"type": "rectangle"}]));
}

#[tokio::test]
async fn rooms_are_isolated_from_each_other() {
    let store = Arc::new(MemoryStore::new());
    let mut alpha = Room::hydrate("alpha".into(), store.clone()).await;
    let mut beta = Room::hydrate("beta".into(), store.clone()).await;

    let (id_a, tx_a, _rx_a) = conn();
    alpha.attach(id_a, tx_a);
    let (id_b, tx_b, mut rx_b) = conn();
    beta.attach(id_b, tx_b);
    let _ = recv_message(&mut rx_b); // init

    alpha.inbound(id_a, canvas_update_bytes(json!([{"type": "rectangle"}])));

    assert_no_frame(&mut rx_b);
    assert_eq!(beta.snapshot.elements, json!([]));
    wait_for_store(&store, "alpha", |s| s.created_at.is_some()).await;
    assert!(store.stored("beta").is_none_or(|s| s.created_at.is_none()));
}

// =============================================================================
// EXPIRY
// =============================================================================

#[tokio::test]
async fn expired_room_is_purged_and_the_first_attach_is_told() {
    let store = Arc::new(MemoryStore::new());
    let mut stale = wire::RoomSnapshot::new();
    stale.elements = json!([{"type": "rectangle"}]);
    stale.created_at = Some(1);
    stale.last_activity_at = now_ms() - (RETENTION_MS + 1_000);
    store.seed("demo", stale);

    let mut room = Room::hydrate("demo".into(), store.clone()).await;
    let (id_a, tx_a, mut rx_a) = conn();
    room.attach(id_a, tx_a);

    let RoomMessage::RoomExpired { message, inactive_days } = recv_message(&mut rx_a) else {
        panic!("expected room-expired first");
    };
    assert_eq!(inactive_days, 90);
    assert!(message.contains("90"));

    let RoomMessage::Init { state, active_users } = recv_message(&mut rx_a) else {
        panic!("expected init after the notice");
    };
    assert!(state.is_none(), "expired state must never be served");
    assert_eq!(active_users, 1);

    // Only the triggering connection hears about the expiry.
    let (id_b, tx_b, mut rx_b) = conn();
    room.attach(id_b, tx_b);
    let RoomMessage::Init { .. } = recv_message(&mut rx_b) else {
        panic!("expected plain init for later attaches");
    };
}

#[tokio::test]
async fn room_just_inside_retention_is_served_intact() {
    let store = Arc::new(MemoryStore::new());
    let mut recent = wire::RoomSnapshot::new();
    recent.elements = json!([{"type": "rectangle"}]);
    recent.created_at = Some(1);
    // 89 days 23 hours of inactivity.
    recent.last_activity_at = now_ms() - (RETENTION_MS - 60 * 60 * 1000);
    store.seed("demo", recent);

    let mut room = Room::hydrate("demo".into(), store.clone()).await;
    let (id_a, tx_a, mut rx_a) = conn();
    room.attach(id_a, tx_a);

    let RoomMessage::Init { state, .. } = recv_message(&mut rx_a) else {
        panic!("expected init");
    };
    assert_eq!(state.expect("state").elements, json!([{"type": "rectangle"}]));
}
