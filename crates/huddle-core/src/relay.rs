//! Room relay engine for Huddle.
//!
//! The relay turns per-connection events (join, send, disconnect) into
//! room-wide broadcasts. It owns the connection registry and the room
//! directory and is shared by every connection task.

use crate::message::{joined_notice, left_notice, time_of_day, DEFAULT_TIME_FORMAT};
use crate::registry::{ConnectionId, Outbox, Registry};
use crate::room::{validate_room_id, Directory, RoomId};
use huddle_protocol::{ChatMessage, Event, EventKind, JoinRoom};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Relay errors.
///
/// None of these are reported back over the socket; the relay has no
/// channel to the caller other than room broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Join without a room id.
    #[error("Join without a room id")]
    MissingRoom,

    /// Send or disconnect from a connection that joined without a name.
    #[error("Connection {0} joined without a display name")]
    Nameless(ConnectionId),

    /// Room id failed validation.
    #[error("Invalid room id: {0}")]
    InvalidRoom(&'static str),

    /// Send or disconnect from a connection that never joined a room.
    #[error("Connection {0} is not in a room")]
    NotInRoom(ConnectionId),

    /// Connection is not registered.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Maximum number of rooms reached.
    #[error("Maximum rooms reached")]
    RoomLimitReached,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum number of live rooms.
    pub max_rooms: usize,
    /// strftime format for message timestamps.
    pub time_format: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_rooms: 10_000,
            time_format: DEFAULT_TIME_FORMAT.to_string(),
        }
    }
}

/// An inbound event for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Join a room under a display name.
    Join {
        display_name: Option<String>,
        room_id: Option<String>,
    },
    /// Post to the current room.
    Send { message: String },
    /// Transport teardown.
    Disconnect,
}

impl From<JoinRoom> for RelayEvent {
    fn from(join: JoinRoom) -> Self {
        RelayEvent::Join {
            display_name: join.user_name,
            room_id: join.room_id,
        }
    }
}

impl TryFrom<Event> for RelayEvent {
    type Error = EventKind;

    /// Convert a wire event. Server-to-client events are rejected.
    fn try_from(event: Event) -> Result<Self, Self::Error> {
        match event {
            Event::JoinRoom(join) => Ok(join.into()),
            Event::SendMessage(message) => Ok(RelayEvent::Send { message }),
            other => Err(other.kind()),
        }
    }
}

/// The room relay.
///
/// Holds the registry of live connections and the directory of rooms.
/// Every operation completes without blocking; broadcasts are queued on
/// each member's outbox.
pub struct Relay {
    registry: Registry,
    directory: Directory,
    config: RelayConfig,
}

impl Relay {
    /// Create a new relay with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RelayConfig::default())
    }

    /// Create a new relay with custom configuration.
    #[must_use]
    pub fn with_config(config: RelayConfig) -> Self {
        info!("Creating relay with config: {:?}", config);
        Self {
            registry: Registry::new(),
            directory: Directory::new(),
            config,
        }
    }

    /// Get relay statistics.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            room_count: self.directory.len(),
            connection_count: self.registry.len(),
            joined_count: self.registry.joined_count(),
        }
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of live rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.directory.len()
    }

    /// Register a new connection and return its outbound queue.
    pub fn connect(&self, connection_id: impl Into<ConnectionId>) -> Outbox {
        self.registry.register(connection_id)
    }

    /// Dispatch an event to the matching operation.
    ///
    /// Returns the number of connections the resulting broadcast was
    /// queued for.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying operation.
    pub fn handle(&self, connection_id: &str, event: RelayEvent) -> Result<usize, RelayError> {
        match event {
            RelayEvent::Join {
                display_name,
                room_id,
            } => {
                let room_id = room_id.ok_or(RelayError::MissingRoom)?;
                self.join(connection_id, display_name.as_deref().unwrap_or(""), &room_id)
            }
            RelayEvent::Send { message } => self.send(connection_id, message),
            RelayEvent::Disconnect => self.disconnect(connection_id),
        }
    }

    /// Join a room, leaving the previous one.
    ///
    /// Announces the join to every member of the room, the joiner
    /// included. Joining the current room again keeps membership as is
    /// and re-announces. An empty name joins silently: the connection
    /// receives the room's broadcasts but cannot send, and its departure
    /// is not announced.
    ///
    /// # Errors
    ///
    /// Returns an error if the room id is missing or invalid, the
    /// connection is unknown, or the room limit is reached.
    pub fn join(
        &self,
        connection_id: &str,
        display_name: &str,
        room_id: &str,
    ) -> Result<usize, RelayError> {
        if room_id.is_empty() {
            return Err(RelayError::MissingRoom);
        }
        validate_room_id(room_id).map_err(RelayError::InvalidRoom)?;
        let display_name = Some(display_name).filter(|name| !name.is_empty());

        let previous = self
            .registry
            .info(connection_id)
            .ok_or_else(|| RelayError::UnknownConnection(connection_id.to_string()))?;
        let switching_from = previous
            .room_id
            .as_deref()
            .filter(|old_room| *old_room != room_id);

        // Leaving a room as its last member frees a slot for the new one.
        let max_rooms = match switching_from {
            Some(old_room) if self.directory.is_sole_member(old_room, connection_id) => {
                self.config.max_rooms.saturating_add(1)
            }
            _ => self.config.max_rooms,
        };

        if self
            .directory
            .join(room_id, connection_id, max_rooms)
            .is_none()
        {
            warn!(connection = %connection_id, room = %room_id, "Room limit reached");
            return Err(RelayError::RoomLimitReached);
        }

        if let Some(old_room) = switching_from {
            self.directory.leave(old_room, connection_id);
            if let Some(old_name) = previous.display_name.as_deref() {
                let notice = ChatMessage::system(left_notice(old_name), self.now());
                self.broadcast(old_room, notice);
            }
            debug!(
                connection = %connection_id,
                from = %old_room,
                to = %room_id,
                "Switched rooms"
            );
        }

        self.registry
            .set_membership(connection_id, display_name.map(str::to_string), room_id);

        let Some(display_name) = display_name else {
            info!(connection = %connection_id, room = %room_id, "Joined room without a name");
            return Ok(0);
        };

        info!(connection = %connection_id, user = %display_name, room = %room_id, "Joined room");

        let notice = ChatMessage::system(joined_notice(display_name), self.now());
        Ok(self.broadcast(room_id, notice))
    }

    /// Send a message to the caller's room, the caller included.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or not in a room.
    pub fn send(
        &self,
        connection_id: &str,
        message: impl Into<String>,
    ) -> Result<usize, RelayError> {
        let info = self
            .registry
            .info(connection_id)
            .ok_or_else(|| RelayError::UnknownConnection(connection_id.to_string()))?;

        let Some((display_name, room_id)) = info.membership() else {
            let id = connection_id.to_string();
            return Err(if info.room_id.is_some() {
                RelayError::Nameless(id)
            } else {
                RelayError::NotInRoom(id)
            });
        };

        let message = ChatMessage::new(display_name, message, self.now());
        let count = self.broadcast(room_id, message);
        trace!(connection = %connection_id, room = %room_id, recipients = count, "Relayed message");
        Ok(count)
    }

    /// Drop a connection, announcing its departure to the room it was in.
    ///
    /// The connection is unregistered either way.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown, never joined a room
    /// or joined without a name.
    pub fn disconnect(&self, connection_id: &str) -> Result<usize, RelayError> {
        let info = self
            .registry
            .unregister(connection_id)
            .ok_or_else(|| RelayError::UnknownConnection(connection_id.to_string()))?;

        let Some(room_id) = info.room_id.as_deref() else {
            debug!(connection = %connection_id, "Disconnected before joining any room");
            return Err(RelayError::NotInRoom(connection_id.to_string()));
        };

        self.directory.leave(room_id, connection_id);

        let Some((display_name, room_id)) = info.membership() else {
            debug!(connection = %connection_id, room = %room_id, "Nameless member disconnected");
            return Err(RelayError::Nameless(connection_id.to_string()));
        };

        let notice = ChatMessage::system(left_notice(display_name), self.now());
        let count = self.broadcast(room_id, notice);

        info!(connection = %connection_id, user = %display_name, room = %room_id, "Disconnected from room");
        Ok(count)
    }

    /// Queue a message for every member of a room.
    ///
    /// Returns the number of members the message was queued for.
    fn broadcast(&self, room_id: &str, message: ChatMessage) -> usize {
        let members = self.directory.members(room_id);
        let message = Arc::new(message);

        let count = members
            .iter()
            .filter(|member| self.registry.deliver(member, Arc::clone(&message)))
            .count();

        trace!(room = %room_id, members = members.len(), delivered = count, "Broadcast");
        count
    }

    fn now(&self) -> String {
        time_of_day(&self.config.time_format)
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, room_id: &str) -> bool {
        self.directory.contains(room_id)
    }

    /// Get the members of a room.
    #[must_use]
    pub fn members(&self, room_id: &str) -> Vec<ConnectionId> {
        self.directory.members(room_id)
    }

    /// Get the member count of a room.
    #[must_use]
    pub fn member_count(&self, room_id: &str) -> usize {
        self.directory.member_count(room_id)
    }

    /// Get all room ids.
    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.directory.room_ids()
    }

    /// Get the room a connection is in.
    #[must_use]
    pub fn room_of(&self, connection_id: &str) -> Option<RoomId> {
        self.registry.info(connection_id)?.room_id
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.registry.contains(connection_id)
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

/// Relay statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStats {
    /// Number of live rooms.
    pub room_count: usize,
    /// Number of registered connections.
    pub connection_count: usize,
    /// Number of connections currently in a room.
    pub joined_count: usize,
}
