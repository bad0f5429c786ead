//! Rooms and the room directory.
//!
//! A room is a named set of connections that receive each other's
//! broadcasts. Rooms are created on first join and discarded as soon as
//! their last member leaves.

use dashmap::DashMap;
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Maximum room id length in bytes.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// A room identifier.
pub type RoomId = String;

/// Validate a room id.
///
/// # Errors
///
/// Returns an error message if the room id is invalid.
pub fn validate_room_id(room_id: &str) -> Result<(), &'static str> {
    if room_id.is_empty() {
        return Err("Room id cannot be empty");
    }
    if room_id.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room id too long");
    }
    if room_id.chars().any(char::is_control) {
        return Err("Room id contains control characters");
    }
    Ok(())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A chat room.
#[derive(Debug, Clone)]
pub struct Room {
    /// Room id.
    id: RoomId,
    /// Member connection IDs.
    members: HashSet<String>,
    /// Creation time (ms since epoch).
    created_at: u64,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(id: impl Into<RoomId>) -> Self {
        Self {
            id: id.into(),
            members: HashSet::new(),
            created_at: now_millis(),
        }
    }

    /// Milliseconds since the room was created.
    #[must_use]
    pub fn age_millis(&self) -> u64 {
        now_millis().saturating_sub(self.created_at)
    }

    /// Get the room id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if a connection is a member.
    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.members.contains(connection_id)
    }

    /// Add a member. Returns `true` if it was not already present.
    pub fn insert(&mut self, connection_id: impl Into<String>) -> bool {
        self.members.insert(connection_id.into())
    }

    /// Remove a member. Returns `true` if it was present.
    pub fn remove(&mut self, connection_id: &str) -> bool {
        self.members.remove(connection_id)
    }

    /// Get all member IDs.
    #[must_use]
    pub fn members(&self) -> Vec<String> {
        self.members.iter().cloned().collect()
    }

    /// Check if the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Outcome of removing a member from a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    /// The connection was a member.
    pub removed: bool,
    /// The room was discarded because it became empty.
    pub room_closed: bool,
}

/// Directory of live rooms.
#[derive(Debug, Default)]
pub struct Directory {
    rooms: DashMap<RoomId, Room>,
}

impl Directory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live rooms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Check if there are no live rooms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Check if a room exists.
    #[must_use]
    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Check if a connection is the only member of a room.
    #[must_use]
    pub fn is_sole_member(&self, room_id: &str, connection_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.member_count() == 1 && room.contains(connection_id))
    }

    /// Add a connection to a room, creating the room if absent.
    ///
    /// Returns `None` without touching the directory if the room does not
    /// exist and `max_rooms` rooms are already live. Otherwise returns
    /// `Some(created)`.
    ///
    /// The limit is soft: the count is read before the room is inserted,
    /// so concurrent joins to distinct new rooms can overshoot it by the
    /// number of racing callers.
    pub fn join(&self, room_id: &str, connection_id: &str, max_rooms: usize) -> Option<bool> {
        if !self.rooms.contains_key(room_id) && self.rooms.len() >= max_rooms {
            return None;
        }

        let mut created = false;
        let mut room = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            created = true;
            Room::new(room_id)
        });
        room.insert(connection_id);

        if created {
            debug!(room = %room_id, "Created room");
        }
        debug!(
            room = %room_id,
            connection = %connection_id,
            members = room.member_count(),
            "Joined room"
        );

        Some(created)
    }

    /// Remove a connection from a room, discarding the room if it
    /// becomes empty.
    pub fn leave(&self, room_id: &str, connection_id: &str) -> Departure {
        let removed = match self.rooms.get_mut(room_id) {
            Some(mut room) => room.remove(connection_id),
            None => false,
        };

        if removed {
            debug!(room = %room_id, connection = %connection_id, "Left room");
        }

        // Re-checked under the shard lock so a concurrent join is never lost.
        let closed = self.rooms.remove_if(room_id, |_, room| room.is_empty());
        let room_closed = match closed {
            Some((_, room)) => {
                debug!(room = %room.id(), age_ms = room.age_millis(), "Deleted empty room");
                true
            }
            None => false,
        };

        Departure {
            removed,
            room_closed,
        }
    }

    /// Get the members of a room. Empty if the room does not exist.
    #[must_use]
    pub fn members(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|room| room.members())
            .unwrap_or_default()
    }

    /// Get the member count of a room.
    #[must_use]
    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms
            .get(room_id)
            .map(|room| room.member_count())
            .unwrap_or(0)
    }

    /// Get all room ids.
    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_creation() {
        let room = Room::new("lobby");
        assert_eq!(room.id(), "lobby");
        assert_eq!(room.member_count(), 0);
        assert!(room.is_empty());
    }

    #[test]
    fn test_room_insert_remove() {
        let mut room = Room::new("lobby");

        assert!(room.insert("conn-1"));
        assert!(!room.insert("conn-1"));
        assert!(room.insert("conn-2"));
        assert_eq!(room.member_count(), 2);

        assert!(room.remove("conn-1"));
        assert!(!room.contains("conn-1"));
        assert!(!room.remove("conn-1"));
    }

    #[test]
    fn test_room_id_validation() {
        assert!(validate_room_id("lobby").is_ok());
        assert!(validate_room_id("room 42 / général").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("bad\nroom").is_err());

        let long_id = "a".repeat(MAX_ROOM_ID_LENGTH + 1);
        assert!(validate_room_id(&long_id).is_err());
    }

    #[test]
    fn test_directory_join_leave() {
        let directory = Directory::new();

        assert_eq!(directory.join("lobby", "conn-1", 10), Some(true));
        assert_eq!(directory.join("lobby", "conn-2", 10), Some(false));
        assert_eq!(directory.member_count("lobby"), 2);

        let departure = directory.leave("lobby", "conn-1");
        assert!(departure.removed);
        assert!(!departure.room_closed);

        let departure = directory.leave("lobby", "conn-2");
        assert!(departure.room_closed);
        assert!(!directory.contains("lobby"));
        assert!(directory.is_empty());
    }

    #[test]
    fn test_directory_sole_member() {
        let directory = Directory::new();
        directory.join("lobby", "conn-1", 10);

        assert!(directory.is_sole_member("lobby", "conn-1"));
        assert!(!directory.is_sole_member("lobby", "conn-2"));
        assert!(!directory.is_sole_member("nowhere", "conn-1"));

        directory.join("lobby", "conn-2", 10);
        assert!(!directory.is_sole_member("lobby", "conn-1"));
    }

    #[test]
    fn test_directory_leave_unknown() {
        let directory = Directory::new();
        let departure = directory.leave("nowhere", "conn-1");
        assert!(!departure.removed);
        assert!(!departure.room_closed);
    }

    #[test]
    fn test_directory_room_limit() {
        let directory = Directory::new();

        assert!(directory.join("a", "conn-1", 1).is_some());
        assert!(directory.join("b", "conn-2", 1).is_none());
        // Existing rooms stay joinable at the limit.
        assert!(directory.join("a", "conn-2", 1).is_some());
        assert_eq!(directory.room_ids(), vec!["a".to_string()]);
    }
}
