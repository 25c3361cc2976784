//! Room coordinator — the per-room state machine.
//!
//! DESIGN
//! ======
//! Every room runs as one spawned task owning its snapshot, its connection
//! registry, and its snapshot writer. Connection and message events arrive
//! on a bounded channel and are handled one at a time, so state mutation
//! needs no locking and broadcasts keep acceptance order. Rooms are fully
//! independent tasks; nothing is shared between them but the store handle.
//!
//! LIFECYCLE
//! =========
//! 1. First connection to a name spawns the task, which hydrates from the
//!    store before draining any event — a second connection arriving
//!    mid-load queues behind the hydrate instead of racing a duplicate load.
//! 2. A snapshot past the retention window is purged during hydration; the
//!    connection that triggered the load is told via `room-expired` and the
//!    room restarts empty.
//! 3. Attach / Inbound / Detach events drain in order. Inbound updates are
//!    relayed to peers before any persistence work.
//! 4. The task stays resident for the process lifetime; only the durable
//!    snapshot outlives it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wire::{CodecError, RoomMessage, RoomSnapshot};

use crate::services::persistence::{SnapshotStore, SnapshotWriter};
use crate::services::registry::ConnectionRegistry;
use crate::services::store::{self, Hydration};
use crate::state::{AppState, RoomHandle};

/// Events queued per room before senders feel backpressure.
const ROOM_EVENT_QUEUE: usize = 1024;

// =============================================================================
// EVENTS
// =============================================================================

/// Everything a room reacts to. Produced by connection tasks, consumed by
/// exactly one room task.
pub enum RoomEvent {
    /// A connection finished its handshake and wants in.
    Attach { conn_id: Uuid, tx: mpsc::Sender<Bytes> },
    /// Raw message bytes received from an attached connection.
    Inbound { conn_id: Uuid, bytes: Bytes },
    /// A connection's socket closed.
    Detach { conn_id: Uuid },
}

/// Get the event channel for a room, spawning its task on first use.
pub(crate) async fn room_channel(state: &AppState, room: &str) -> mpsc::Sender<RoomEvent> {
    let mut rooms = state.rooms.write().await;
    if let Some(handle) = rooms.get(room) {
        return handle.events.clone();
    }

    let (tx, rx) = mpsc::channel(ROOM_EVENT_QUEUE);
    tokio::spawn(run_room(room.to_owned(), state.store.clone(), rx));
    rooms.insert(room.to_owned(), RoomHandle { events: tx.clone() });
    tx
}

/// Drive one room until the process is recycled.
pub(crate) async fn run_room(
    name: String,
    store: Arc<dyn SnapshotStore>,
    mut events: mpsc::Receiver<RoomEvent>,
) {
    let mut room = Room::hydrate(name, store).await;
    while let Some(event) = events.recv().await {
        room.handle(event);
    }
}

/// Current time as milliseconds since Unix epoch.
fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// ROOM
// =============================================================================

struct Room {
    name: String,
    snapshot: RoomSnapshot,
    registry: ConnectionRegistry,
    writer: SnapshotWriter,
    /// Days-inactive figure held for the connection that triggered an
    /// expired hydration; consumed by its attach.
    pending_expiry: Option<u64>,
}

impl Room {
    /// Load (or freshly initialize) the room state ahead of the event loop.
    async fn hydrate(name: String, store: Arc<dyn SnapshotStore>) -> Self {
        let (snapshot, pending_expiry) = match store::hydrate(&*store, &name, now_ms()).await {
            Hydration::Resident(snapshot) => (snapshot, None),
            Hydration::Empty => (RoomSnapshot::new(), None),
            Hydration::Expired { inactive_days } => (RoomSnapshot::new(), Some(inactive_days)),
        };

        let writer = SnapshotWriter::spawn(store, name.clone());
        info!(room = %name, "room active");

        Self { name, snapshot, registry: ConnectionRegistry::new(), writer, pending_expiry }
    }

    fn handle(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::Attach { conn_id, tx } => self.attach(conn_id, tx),
            RoomEvent::Inbound { conn_id, bytes } => self.inbound(conn_id, bytes),
            RoomEvent::Detach { conn_id } => self.detach(conn_id),
        }
    }

    // =========================================================================
    // CONNECTION LIFECYCLE
    // =========================================================================

    fn attach(&mut self, conn_id: Uuid, tx: mpsc::Sender<Bytes>) {
        store::touch_activity(&mut self.snapshot, now_ms());
        self.writer.submit(self.snapshot.clone());

        self.registry.add(conn_id, tx);

        // The connection that found the stale snapshot learns it expired.
        if let Some(days) = self.pending_expiry.take() {
            let notice = RoomMessage::RoomExpired {
                message: format!("Room expired after {days} days of inactivity"),
                inactive_days: days,
            };
            self.send_to(conn_id, encode(&notice));
        }

        // Full-state snapshot for the newcomer. A room that never accepted a
        // content update presents as `state: None`.
        let init = RoomMessage::Init {
            state: self.snapshot.created_at.is_some().then(|| self.snapshot.clone()),
            active_users: self.registry.active_users(),
        };
        self.send_to(conn_id, encode(&init));

        let joined = RoomMessage::UserJoined {
            user_id: conn_id.to_string(),
            active_users: self.registry.active_users(),
        };
        self.broadcast(encode(&joined), Some(conn_id));

        info!(room = %self.name, %conn_id, active = self.registry.count(), "connection attached");
    }

    fn detach(&mut self, conn_id: Uuid) {
        if !self.registry.remove(conn_id) {
            return;
        }

        let left = RoomMessage::UserLeft {
            user_id: conn_id.to_string(),
            active_users: self.registry.active_users(),
        };
        self.broadcast(encode(&left), None);

        // In-memory state is retained so a fast reconnect skips the load.
        info!(room = %self.name, %conn_id, active = self.registry.count(), "connection detached");
    }

    // =========================================================================
    // MESSAGE HANDLING
    // =========================================================================

    fn inbound(&mut self, conn_id: Uuid, bytes: Bytes) {
        let message = match wire::decode_message(&bytes) {
            Ok(message) => message,
            Err(CodecError::UnknownKind(kind)) => {
                // Forward compatibility: kinds this build does not know are
                // still relayed to peers, and mutate nothing here.
                debug!(room = %self.name, kind, "relaying unknown message kind");
                self.broadcast(bytes, Some(conn_id));
                return;
            }
            Err(e) => {
                // One client's garbage never disturbs the rest of the room.
                warn!(room = %self.name, %conn_id, error = %e, "dropping undecodable message");
                return;
            }
        };

        // Relay to peers first; persistence must never sit on the latency
        // path between two collaborators.
        self.broadcast(bytes, Some(conn_id));

        let now = now_ms();
        match message {
            RoomMessage::CanvasUpdate { elements, app_state, files } => {
                store::apply_canvas_update(&mut self.snapshot, elements, app_state, files, now);
            }
            RoomMessage::MarkdownUpdate { markdown_notes } => {
                store::apply_markdown_update(&mut self.snapshot, markdown_notes, now);
            }
            RoomMessage::ImageUpdate { image_history } => {
                store::apply_image_update(&mut self.snapshot, image_history, now);
            }
            other => {
                // Server-origin kinds arriving from a client mutate nothing.
                debug!(room = %self.name, kind = other.kind_name(), "ignoring non-update message");
                return;
            }
        }

        self.writer.submit(self.snapshot.clone());
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    fn send_to(&self, conn_id: Uuid, bytes: Bytes) {
        let Some(tx) = self.registry.sender(conn_id) else {
            return;
        };
        if tx.try_send(bytes).is_err() {
            debug!(room = %self.name, %conn_id, "dropping frame for saturated connection");
        }
    }

    /// Best-effort fan-out; a slow client's full queue drops frames for that
    /// client only.
    fn broadcast(&self, bytes: Bytes, exclude: Option<Uuid>) {
        for (conn_id, tx) in self.registry.all_except(exclude) {
            if tx.try_send(bytes.clone()).is_err() {
                debug!(room = %self.name, %conn_id, "dropping frame for saturated connection");
            }
        }
    }
}

fn encode(message: &RoomMessage) -> Bytes {
    Bytes::from(wire::encode_message(message))
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
