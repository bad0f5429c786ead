//! Connection registry for Huddle.
//!
//! The registry owns every live connection from transport connect to
//! transport disconnect, along with the display name and room recorded
//! when the connection joined.

use dashmap::DashMap;
use huddle_protocol::ChatMessage;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::room::RoomId;

/// A connection identifier.
pub type ConnectionId = String;

/// Receiving half of a connection's outbound queue.
pub type Outbox = mpsc::UnboundedReceiver<Arc<ChatMessage>>;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// State held for a single live connection.
#[derive(Debug)]
struct ConnectionEntry {
    display_name: Option<String>,
    room_id: Option<RoomId>,
    connected_at: u64,
    outbox: mpsc::UnboundedSender<Arc<ChatMessage>>,
}

/// Snapshot of a connection's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection ID.
    pub connection_id: ConnectionId,
    /// Name given at the last join.
    pub display_name: Option<String>,
    /// Room the connection is currently in.
    pub room_id: Option<RoomId>,
    /// When the connection was registered (ms since epoch).
    pub connected_at: u64,
}

impl ConnectionInfo {
    /// Name and room, if the connection has joined a room under a name.
    #[must_use]
    pub fn membership(&self) -> Option<(&str, &str)> {
        match (&self.display_name, &self.room_id) {
            (Some(name), Some(room)) => Some((name.as_str(), room.as_str())),
            _ => None,
        }
    }
}

/// Registry of live connections.
#[derive(Debug, Default)]
pub struct Registry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no live connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of connections currently in a room.
    #[must_use]
    pub fn joined_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.room_id.is_some())
            .count()
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Register a connection and return its outbound queue.
    ///
    /// Registering an id twice replaces the previous entry; the old
    /// queue is closed.
    pub fn register(&self, connection_id: impl Into<ConnectionId>) -> Outbox {
        let connection_id = connection_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = ConnectionEntry {
            display_name: None,
            room_id: None,
            connected_at: now_millis(),
            outbox: tx,
        };
        if self.connections.insert(connection_id.clone(), entry).is_some() {
            debug!(connection = %connection_id, "Replaced existing registration");
        }
        debug!(connection = %connection_id, "Connection registered");
        rx
    }

    /// Remove a connection, returning its last known metadata.
    pub fn unregister(&self, connection_id: &str) -> Option<ConnectionInfo> {
        let (id, entry) = self.connections.remove(connection_id)?;
        debug!(connection = %id, "Connection unregistered");
        Some(ConnectionInfo {
            connection_id: id,
            display_name: entry.display_name,
            room_id: entry.room_id,
            connected_at: entry.connected_at,
        })
    }

    /// Get a snapshot of a connection's metadata.
    #[must_use]
    pub fn info(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections
            .get(connection_id)
            .map(|entry| ConnectionInfo {
                connection_id: entry.key().clone(),
                display_name: entry.display_name.clone(),
                room_id: entry.room_id.clone(),
                connected_at: entry.connected_at,
            })
    }

    /// Record the room of a connection and the name it joined under.
    ///
    /// A `None` name clears any earlier one. Returns `false` if the
    /// connection is not registered.
    pub fn set_membership(
        &self,
        connection_id: &str,
        display_name: Option<String>,
        room_id: impl Into<RoomId>,
    ) -> bool {
        match self.connections.get_mut(connection_id) {
            Some(mut entry) => {
                entry.display_name = display_name;
                entry.room_id = Some(room_id.into());
                true
            }
            None => false,
        }
    }

    /// Queue a message on a connection's outbox.
    ///
    /// Returns `true` if the message was queued. Fails when the connection
    /// is unknown or its receiving half has been dropped.
    pub fn deliver(&self, connection_id: &str, message: Arc<ChatMessage>) -> bool {
        let Some(entry) = self.connections.get(connection_id) else {
            trace!(connection = %connection_id, "Delivery to unknown connection");
            return false;
        };
        entry.outbox.send(message).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_unregister() {
        let registry = Registry::new();
        let _rx = registry.register("conn-1");

        assert!(registry.contains("conn-1"));
        assert_eq!(registry.len(), 1);

        let info = registry.unregister("conn-1").unwrap();
        assert_eq!(info.connection_id, "conn-1");
        assert!(info.membership().is_none());
        assert!(registry.is_empty());
        assert!(registry.unregister("conn-1").is_none());
    }

    #[test]
    fn test_set_membership() {
        let registry = Registry::new();
        let _rx = registry.register("conn-1");

        assert!(registry.set_membership("conn-1", Some("Alice".to_string()), "lobby"));
        assert!(!registry.set_membership("conn-2", Some("Bob".to_string()), "lobby"));

        let info = registry.info("conn-1").unwrap();
        assert_eq!(info.membership(), Some(("Alice", "lobby")));
        assert_eq!(registry.joined_count(), 1);
    }

    #[test]
    fn test_nameless_membership() {
        let registry = Registry::new();
        let _rx = registry.register("conn-1");

        registry.set_membership("conn-1", Some("Alice".to_string()), "lobby");
        registry.set_membership("conn-1", None, "den");

        let info = registry.info("conn-1").unwrap();
        assert_eq!(info.room_id.as_deref(), Some("den"));
        assert!(info.membership().is_none());
        assert_eq!(registry.joined_count(), 1);
    }

    #[test]
    fn test_deliver() {
        let registry = Registry::new();
        let mut rx = registry.register("conn-1");

        let message = Arc::new(ChatMessage::new("Alice", "hi", "1:00:00 PM"));
        assert!(registry.deliver("conn-1", Arc::clone(&message)));
        assert!(!registry.deliver("conn-2", Arc::clone(&message)));

        assert_eq!(rx.try_recv().unwrap().message, "hi");
    }

    #[test]
    fn test_deliver_to_dropped_outbox() {
        let registry = Registry::new();
        drop(registry.register("conn-1"));

        let message = Arc::new(ChatMessage::new("Alice", "hi", "1:00:00 PM"));
        assert!(!registry.deliver("conn-1", message));
    }

    #[test]
    fn test_reregister_closes_old_outbox() {
        let registry = Registry::new();
        let mut old = registry.register("conn-1");
        let _new = registry.register("conn-1");

        assert_eq!(registry.len(), 1);
        assert!(old.try_recv().is_err());
    }
}
