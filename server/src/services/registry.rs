//! Connection registry — presence counting and broadcast fan-out targets.
//!
//! Purely in-memory and owned exclusively by one room's event loop; no other
//! component reads or writes it.

use std::collections::HashMap;

use axum::body::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Connections currently attached to one room, keyed by connection ID.
/// Each entry holds the bounded sender feeding that connection's socket task.
pub(crate) struct ConnectionRegistry {
    senders: HashMap<Uuid, mpsc::Sender<Bytes>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self { senders: HashMap::new() }
    }

    pub(crate) fn add(&mut self, conn_id: Uuid, tx: mpsc::Sender<Bytes>) {
        self.senders.insert(conn_id, tx);
    }

    /// Returns whether the connection was registered.
    pub(crate) fn remove(&mut self, conn_id: Uuid) -> bool {
        self.senders.remove(&conn_id).is_some()
    }

    #[must_use]
    pub(crate) fn count(&self) -> usize {
        self.senders.len()
    }

    /// Presence count as carried on the wire.
    #[must_use]
    pub(crate) fn active_users(&self) -> u32 {
        u32::try_from(self.senders.len()).unwrap_or(u32::MAX)
    }

    /// Sender for one connection, if attached.
    #[must_use]
    pub(crate) fn sender(&self, conn_id: Uuid) -> Option<&mpsc::Sender<Bytes>> {
        self.senders.get(&conn_id)
    }

    /// All attached connections except an optionally excluded one.
    pub(crate) fn all_except(
        &self,
        exclude: Option<Uuid>,
    ) -> impl Iterator<Item = (Uuid, &mpsc::Sender<Bytes>)> {
        self.senders
            .iter()
            .filter(move |(conn_id, _)| exclude != Some(**conn_id))
            .map(|(conn_id, tx)| (*conn_id, tx))
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
