//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the durable snapshot store and the map of live room event channels.
//! Room tasks own their in-memory state exclusively; this map only routes
//! connection and message events to them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};

use crate::services::persistence::SnapshotStore;
use crate::services::room::RoomEvent;

/// Handle to one live room task.
pub struct RoomHandle {
    /// Event channel into the room's coordinator loop.
    pub events: mpsc::Sender<RoomEvent>,
}

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum — all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    /// Durable whole-blob snapshot storage shared by every room.
    pub store: Arc<dyn SnapshotStore>,
    /// Live rooms keyed by room name. A room stays resident once spawned.
    pub rooms: Arc<RwLock<HashMap<String, RoomHandle>>>,
    /// Shared outbound client for the passthrough facet.
    pub http: reqwest::Client,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn SnapshotStore>, http: reqwest::Client) -> Self {
        Self { store, rooms: Arc::new(RwLock::new(HashMap::new())), http }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
