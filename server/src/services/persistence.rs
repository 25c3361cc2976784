//! Durable persistence — snapshot store interface and the per-room writer.
//!
//! DESIGN
//! ======
//! One JSONB blob per room key; whole-blob get/put/delete only, no
//! field-level writes. Snapshot writes ride a per-room single-flight writer
//! fed by a `watch` channel: submits from the event loop never block, bursts
//! coalesce to the newest snapshot, and at most one write per room is in
//! flight — a newer snapshot can never be overtaken by an older one landing
//! late.
//!
//! ERROR HANDLING
//! ==============
//! A failed or timed-out write is logged and dropped; the in-memory state
//! stays authoritative and the next submit is the retry point. Clients are
//! never disconnected over storage trouble.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{info, warn};
use wire::RoomSnapshot;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("snapshot serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Keyed whole-blob storage the room loads from and persists to. The only
/// resource shared across process restarts.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, room: &str) -> Result<Option<RoomSnapshot>, StoreError>;
    async fn put(&self, room: &str, snapshot: &RoomSnapshot) -> Result<(), StoreError>;
    async fn delete(&self, room: &str) -> Result<(), StoreError>;
}

// =============================================================================
// POSTGRES ADAPTER
// =============================================================================

/// `SnapshotStore` backed by the `room_snapshots` table.
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn get(&self, room: &str) -> Result<Option<RoomSnapshot>, StoreError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT snapshot FROM room_snapshots WHERE room_name = $1")
                .bind(room)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(blob,)| serde_json::from_value(blob))
            .transpose()
            .map_err(Into::into)
    }

    async fn put(&self, room: &str, snapshot: &RoomSnapshot) -> Result<(), StoreError> {
        let blob = serde_json::to_value(snapshot)?;
        sqlx::query(
            "INSERT INTO room_snapshots (room_name, snapshot) VALUES ($1, $2) \
             ON CONFLICT (room_name) DO UPDATE SET \
                 snapshot = EXCLUDED.snapshot, updated_at = now()",
        )
        .bind(room)
        .bind(&blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, room: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM room_snapshots WHERE room_name = $1")
            .bind(room)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// =============================================================================
// SNAPSHOT WRITER
// =============================================================================

const DEFAULT_SNAPSHOT_WRITE_TIMEOUT_MS: u64 = 10_000;

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Fire-and-forget snapshot persistence for one room.
pub(crate) struct SnapshotWriter {
    latest: watch::Sender<Option<RoomSnapshot>>,
}

impl SnapshotWriter {
    /// Spawn the writer task for a room.
    pub(crate) fn spawn(store: Arc<dyn SnapshotStore>, room: String) -> Self {
        let timeout_ms = env_parse("SNAPSHOT_WRITE_TIMEOUT_MS", DEFAULT_SNAPSHOT_WRITE_TIMEOUT_MS);
        let (latest, mut rx) = watch::channel(None::<RoomSnapshot>);

        tokio::spawn(async move {
            info!(room, timeout_ms, "snapshot writer started");
            while rx.changed().await.is_ok() {
                // Intermediate snapshots submitted while a write was in
                // flight collapse into this one read.
                let snapshot = rx.borrow_and_update().clone();
                let Some(snapshot) = snapshot else { continue };

                let write = store.put(&room, &snapshot);
                match tokio::time::timeout(Duration::from_millis(timeout_ms), write).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(error = %e, room, "snapshot write failed; in-memory state remains authoritative");
                    }
                    Err(_) => {
                        warn!(room, timeout_ms, "snapshot write timed out; in-memory state remains authoritative");
                    }
                }
            }
        });

        Self { latest }
    }

    /// Queue the newest snapshot for writing. Never blocks the event loop.
    pub(crate) fn submit(&self, snapshot: RoomSnapshot) {
        let _ = self.latest.send(Some(snapshot));
    }
}

// =============================================================================
// IN-MEMORY STORE (tests)
// =============================================================================

#[cfg(test)]
pub mod memory {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// In-memory `SnapshotStore` used by coordinator and route tests.
    #[derive(Default)]
    pub struct MemoryStore {
        rooms: Mutex<HashMap<String, RoomSnapshot>>,
        fail_writes: AtomicBool,
    }

    impl MemoryStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Snapshot currently stored for a room, if any.
        #[must_use]
        pub fn stored(&self, room: &str) -> Option<RoomSnapshot> {
            self.rooms.lock().expect("memory store lock").get(room).cloned()
        }

        /// Seed a room blob directly, bypassing the trait.
        pub fn seed(&self, room: &str, snapshot: RoomSnapshot) {
            self.rooms.lock().expect("memory store lock").insert(room.to_owned(), snapshot);
        }

        /// Make subsequent `put` calls fail, to exercise write-error paths.
        pub fn fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SnapshotStore for MemoryStore {
        async fn get(&self, room: &str) -> Result<Option<RoomSnapshot>, StoreError> {
            Ok(self.rooms.lock().expect("memory store lock").get(room).cloned())
        }

        async fn put(&self, room: &str, snapshot: &RoomSnapshot) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Database(sqlx::Error::PoolClosed));
            }
            self.rooms
                .lock()
                .expect("memory store lock")
                .insert(room.to_owned(), snapshot.clone());
            Ok(())
        }

        async fn delete(&self, room: &str) -> Result<(), StoreError> {
            self.rooms.lock().expect("memory store lock").remove(room);
            Ok(())
        }
    }
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
