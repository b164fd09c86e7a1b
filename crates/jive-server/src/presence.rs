//! Presence registry: which users are connected, and where to send their
//! events.
//!
//! A user occupies at most one slot. A second connection replaces the
//! first; the replaced connection stays open but no longer receives
//! fan-out. The registry performs no I/O; status broadcasts are the
//! engine's job.

use std::collections::HashMap;

use jive_shared::constants::OUTBOUND_QUEUE_CAPACITY;
use jive_shared::protocol::{ServerEvent, UserSummary};
use jive_shared::UserId;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Outbound side of one socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    /// A fresh handle and the receiver its socket task drains.
    pub fn channel() -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        (Self { id: Uuid::new_v4(), tx }, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue an event without waiting. Returns `false` if the connection is
    /// gone or its queue is full.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(connection = %self.id, "outbound queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a reply to this connection's own request, waiting for room.
    /// Returns `false` only if the connection is gone.
    pub async fn deliver(&self, event: ServerEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

struct PresenceEntry {
    handle: ConnectionHandle,
    user: UserSummary,
}

#[derive(Default)]
pub struct PresenceRegistry {
    entries: RwLock<HashMap<UserId, PresenceEntry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as the user's active connection. Returns the
    /// connection it replaced, if any.
    pub async fn set_online(
        &self,
        user_id: UserId,
        handle: ConnectionHandle,
        user: UserSummary,
    ) -> Option<ConnectionHandle> {
        let mut entries = self.entries.write().await;
        entries
            .insert(user_id, PresenceEntry { handle, user })
            .map(|previous| previous.handle)
    }

    /// Clear the user's slot if it still belongs to `connection`. A stale
    /// disconnect from a replaced connection is ignored and returns `false`.
    pub async fn set_offline(&self, user_id: UserId, connection: Uuid) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(&user_id) {
            Some(entry) if entry.handle.id == connection => {
                if let Some(entry) = entries.remove(&user_id) {
                    tracing::debug!(user = %user_id, name = %entry.user.name, "presence cleared");
                }
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.entries
            .read()
            .await
            .get(&user_id)
            .map(|entry| entry.handle.clone())
    }

    pub async fn online_user_ids(&self) -> Vec<UserId> {
        self.entries.read().await.keys().copied().collect()
    }

    pub async fn online_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Send `event` to every connected user.
    pub async fn broadcast(&self, event: &ServerEvent) {
        let handles: Vec<ConnectionHandle> = self
            .entries
            .read()
            .await
            .values()
            .map(|entry| entry.handle.clone())
            .collect();
        for handle in handles {
            handle.send(event.clone());
        }
    }
}
