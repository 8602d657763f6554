//! Live connection registry and room fan-out.
//!
//! Tracks which connections belong to which user and which rooms each
//! connection is subscribed to. Broadcasts serialize an event once and
//! queue it on every subscribed connection, skipping the excluded one
//! (normally the sender's own connection).

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::{debug, trace};

use roomcast_protocol::envelope::{Envelope, Event};

use crate::connection::Sender;

struct ConnEntry {
    sender: Sender,
    user_id: String,
}

#[derive(Default)]
struct Inner {
    conns: HashMap<u64, ConnEntry>,
    /// user id -> live connection ids
    user_index: HashMap<String, HashSet<u64>>,
    /// room id -> subscribed connection ids
    rooms: HashMap<String, HashSet<u64>>,
}

/// Registry of live, authenticated connections.
#[derive(Default)]
pub struct RoomRegistry {
    inner: RwLock<Inner>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an authenticated connection.
    pub async fn register(&self, conn_id: u64, user_id: &str, sender: Sender) {
        let mut inner = self.inner.write().await;
        inner.conns.insert(
            conn_id,
            ConnEntry {
                sender,
                user_id: user_id.to_string(),
            },
        );
        inner
            .user_index
            .entry(user_id.to_string())
            .or_default()
            .insert(conn_id);
        trace!(conn_id, user_id, "connection registered");
    }

    /// Removes a connection from the registry and every room.
    pub async fn unregister(&self, conn_id: u64) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.conns.remove(&conn_id) {
            if let Some(set) = inner.user_index.get_mut(&entry.user_id) {
                set.remove(&conn_id);
                if set.is_empty() {
                    inner.user_index.remove(&entry.user_id);
                }
            }
            trace!(conn_id, user_id = %entry.user_id, "connection unregistered");
        }
        for set in inner.rooms.values_mut() {
            set.remove(&conn_id);
        }
    }

    /// Subscribes one connection to a room's broadcasts.
    pub async fn subscribe(&self, conn_id: u64, room_id: &str) {
        let mut inner = self.inner.write().await;
        inner
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(conn_id);
    }

    /// Subscribes every live connection of a user to a room. Used when
    /// a user joins or creates a room mid-session.
    pub async fn subscribe_user(&self, user_id: &str, room_id: &str) {
        let mut inner = self.inner.write().await;
        let conn_ids: Vec<u64> = inner
            .user_index
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        let room = inner.rooms.entry(room_id.to_string()).or_default();
        for conn_id in conn_ids {
            room.insert(conn_id);
        }
    }

    /// Drops every connection of a user from a room. Used on leave.
    pub async fn unsubscribe_user(&self, user_id: &str, room_id: &str) {
        let mut inner = self.inner.write().await;
        let conn_ids: Vec<u64> = inner
            .user_index
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        if let Some(room) = inner.rooms.get_mut(room_id) {
            for conn_id in conn_ids {
                room.remove(&conn_id);
            }
        }
    }

    /// Fans an event out to every connection subscribed to the room,
    /// except `exclude`. Slow receivers lose the frame rather than
    /// blocking the rest of the room.
    pub async fn broadcast(&self, room_id: &str, event: &Event, exclude: Option<u64>) {
        let text = match Envelope::Event(event.clone()).to_text() {
            Ok(text) => text,
            Err(e) => {
                debug!("failed to serialize broadcast: {e}");
                return;
            }
        };

        let inner = self.inner.read().await;
        let Some(subscribers) = inner.rooms.get(room_id) else {
            return;
        };
        for conn_id in subscribers {
            if Some(*conn_id) == exclude {
                continue;
            }
            if let Some(entry) = inner.conns.get(conn_id) {
                entry.sender.send_text(&text);
            }
        }
    }

    /// Returns `true` if the user has at least one live connection.
    pub async fn is_user_online(&self, user_id: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .user_index
            .get(user_id)
            .is_some_and(|set| {
                set.iter().any(|id| {
                    inner
                        .conns
                        .get(id)
                        .is_some_and(|e| e.sender.is_connected())
                })
            })
    }

    /// Number of live registered connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.conns.len()
    }
}
