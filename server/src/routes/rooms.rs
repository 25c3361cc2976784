//! Room endpoint — WebSocket attach and HTTP passthrough on one path.
//!
//! DESIGN
//! ======
//! `GET /rooms/{room}` serves two facets. An upgrade request attaches the
//! socket to the room's event loop; a plain GET with `?url=` proxies
//! external content for embedding. Anything else is 404.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → room task gets `Attach` (it replies with `init`)
//! 2. Socket frames → `Inbound` events; room broadcasts arrive on the
//!    per-connection channel and are written back as binary frames
//! 3. Close → `Detach`

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::services::proxy;
use crate::services::room::{self, RoomEvent};
use crate::state::AppState;

/// Outbound frames queued per connection before broadcasts start dropping.
const OUTBOUND_QUEUE: usize = 256;

pub async fn handle_room(
    State(state): State<AppState>,
    Path(room): Path<String>,
    method: Method,
    Query(params): Query<HashMap<String, String>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // An upgrade request attaches to the room; everything else falls through
    // to the passthrough facet.
    if let Ok(ws) = ws {
        return ws.on_upgrade(move |socket| run_connection(socket, state, room));
    }

    if method == Method::GET {
        if let Some(target) = params.get("url") {
            return proxy::passthrough(&state.http, target).await;
        }
    }

    StatusCode::NOT_FOUND.into_response()
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_connection(mut socket: WebSocket, state: AppState, room: String) {
    let conn_id = Uuid::new_v4();

    // Per-connection channel carrying already-encoded frames from the room.
    let (tx, mut rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);

    let events = room::room_channel(&state, &room).await;
    if events.send(RoomEvent::Attach { conn_id, tx }).await.is_err() {
        return;
    }
    info!(room, %conn_id, "ws: connection opened");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Binary(bytes) => {
                        if events.send(RoomEvent::Inbound { conn_id, bytes }).await.is_err() {
                            break;
                        }
                    }
                    // Text framing carries the same encoding; hand the raw
                    // bytes to the room unchanged.
                    Message::Text(text) => {
                        let bytes = Bytes::from(text.as_bytes().to_vec());
                        if events.send(RoomEvent::Inbound { conn_id, bytes }).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            outbound = rx.recv() => {
                let Some(bytes) = outbound else { break };
                if socket.send(Message::Binary(bytes)).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = events.send(RoomEvent::Detach { conn_id }).await;
    info!(room, %conn_id, "ws: connection closed");
}

#[cfg(test)]
#[path = "rooms_test.rs"]
mod tests;
