//! Room state store — whole-group replacement and the expiry policy.
//!
//! DESIGN
//! ======
//! The room's event loop is the only caller, so every mutation here is plain
//! synchronous code over `&mut RoomSnapshot` — no locks, no torn reads. A
//! field group (`elements`+`appState`+`files`, the note list, the image
//! list) is only ever replaced as a whole, which is what makes
//! last-write-wins explicit instead of a merge race.

use serde_json::Value;
use tracing::{info, warn};
use wire::RoomSnapshot;

use crate::services::persistence::SnapshotStore;

/// Rooms untouched for this long are purged on the next connection attempt.
pub(crate) const RETENTION_DAYS: i64 = 90;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
pub(crate) const RETENTION_MS: i64 = RETENTION_DAYS * DAY_MS;

// =============================================================================
// MUTATION
// =============================================================================

/// Replace the drawing group wholesale.
pub(crate) fn apply_canvas_update(
    state: &mut RoomSnapshot,
    elements: Value,
    app_state: Value,
    files: Value,
    now_ms: i64,
) {
    state.elements = elements;
    state.app_state = app_state;
    state.files = files;
    mark_updated(state, now_ms);
}

/// Replace the note list wholesale.
pub(crate) fn apply_markdown_update(state: &mut RoomSnapshot, notes: Value, now_ms: i64) {
    state.markdown_notes = notes;
    mark_updated(state, now_ms);
}

/// Replace the generated-image list wholesale.
pub(crate) fn apply_image_update(state: &mut RoomSnapshot, history: Value, now_ms: i64) {
    state.image_history = history;
    mark_updated(state, now_ms);
}

/// Record activity without a content update (connection events).
/// `last_activity_at` never regresses, even under out-of-order clocks.
pub(crate) fn touch_activity(state: &mut RoomSnapshot, now_ms: i64) {
    state.last_activity_at = state.last_activity_at.max(now_ms);
}

fn mark_updated(state: &mut RoomSnapshot, now_ms: i64) {
    touch_activity(state, now_ms);
    // `created_at` is write-once: first content update only.
    if state.created_at.is_none() {
        state.created_at = Some(now_ms);
    }
}

// =============================================================================
// EXPIRY
// =============================================================================

/// Whether a snapshot with this activity timestamp has outlived retention.
/// Exactly `RETENTION_MS` of inactivity is still live; one more millisecond
/// is not.
pub(crate) fn is_expired(last_activity_at: i64, now_ms: i64) -> bool {
    now_ms.saturating_sub(last_activity_at) > RETENTION_MS
}

/// Whole days since the last recorded activity.
pub(crate) fn inactive_days(last_activity_at: i64, now_ms: i64) -> u64 {
    let elapsed = now_ms.saturating_sub(last_activity_at).max(0);
    u64::try_from(elapsed / DAY_MS).unwrap_or(0)
}

// =============================================================================
// HYDRATION
// =============================================================================

/// Result of loading a room from durable storage.
pub(crate) enum Hydration {
    /// No stored snapshot (or the store was unreachable).
    Empty,
    /// A snapshot existed but sat past retention; it has been deleted.
    Expired { inactive_days: u64 },
    /// A live snapshot.
    Resident(RoomSnapshot),
}

/// Load a room's snapshot, enforcing the retention window.
///
/// An expired snapshot is purged from the store as a side effect and never
/// served. A store read failure degrades to `Empty` — the room comes up with
/// a fresh state and in-memory remains authoritative until the next
/// successful write.
pub(crate) async fn hydrate(store: &dyn SnapshotStore, room: &str, now_ms: i64) -> Hydration {
    match store.get(room).await {
        Ok(Some(snapshot)) => {
            if is_expired(snapshot.last_activity_at, now_ms) {
                let days = inactive_days(snapshot.last_activity_at, now_ms);
                if let Err(e) = store.delete(room).await {
                    warn!(error = %e, room, "failed to purge expired snapshot");
                }
                info!(room, inactive_days = days, "discarded expired room snapshot");
                Hydration::Expired { inactive_days: days }
            } else {
                info!(room, "hydrated room from storage");
                Hydration::Resident(snapshot)
            }
        }
        Ok(None) => Hydration::Empty,
        Err(e) => {
            warn!(error = %e, room, "snapshot load failed; starting with empty state");
            Hydration::Empty
        }
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
