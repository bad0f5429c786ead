//! Event types for the Huddle protocol.
//!
//! Events are adjacently tagged: the `event` key names the event and the
//! `data` key carries its payload.

use serde::{Deserialize, Serialize};

/// Sender name used for relay-generated notices.
pub const SYSTEM_SENDER: &str = "System";

/// Event kind identifiers, used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JoinRoom,
    SendMessage,
    ReceiveMessage,
}

impl EventKind {
    /// Wire name of the event.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JoinRoom => "joinRoom",
            EventKind::SendMessage => "sendMessage",
            EventKind::ReceiveMessage => "receiveMessage",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `joinRoom` event.
///
/// Both fields are optional on the wire. A join missing either one is
/// rejected by the relay rather than by the decoder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    /// Display name to announce in the room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    /// Room to join.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

/// A line delivered to room members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Display name of the author, or [`SYSTEM_SENDER`] for notices.
    pub sender: String,
    /// Message body.
    pub message: String,
    /// Server-generated time of day.
    pub time: String,
}

impl ChatMessage {
    /// Create a message from a named sender.
    #[must_use]
    pub fn new(
        sender: impl Into<String>,
        message: impl Into<String>,
        time: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            message: message.into(),
            time: time.into(),
        }
    }

    /// Create a relay notice.
    #[must_use]
    pub fn system(message: impl Into<String>, time: impl Into<String>) -> Self {
        Self::new(SYSTEM_SENDER, message, time)
    }

    /// Whether this message was generated by the relay.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.sender == SYSTEM_SENDER
    }
}

/// A protocol event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Event {
    /// Join a room, leaving any previous one.
    #[serde(rename = "joinRoom")]
    JoinRoom(JoinRoom),

    /// Post a message to the sender's current room.
    #[serde(rename = "sendMessage")]
    SendMessage(String),

    /// A message delivered to a room member.
    #[serde(rename = "receiveMessage")]
    ReceiveMessage(ChatMessage),
}

impl Event {
    /// Get the kind of this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Event::JoinRoom(_) => EventKind::JoinRoom,
            Event::SendMessage(_) => EventKind::SendMessage,
            Event::ReceiveMessage(_) => EventKind::ReceiveMessage,
        }
    }

    /// Create a new `joinRoom` event.
    #[must_use]
    pub fn join_room(user_name: impl Into<String>, room_id: impl Into<String>) -> Self {
        Event::JoinRoom(JoinRoom {
            user_name: Some(user_name.into()),
            room_id: Some(room_id.into()),
        })
    }

    /// Create a new `sendMessage` event.
    #[must_use]
    pub fn send_message(message: impl Into<String>) -> Self {
        Event::SendMessage(message.into())
    }

    /// Create a new `receiveMessage` event.
    #[must_use]
    pub fn receive_message(message: ChatMessage) -> Self {
        Event::ReceiveMessage(message)
    }
}

impl From<ChatMessage> for Event {
    fn from(message: ChatMessage) -> Self {
        Event::ReceiveMessage(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind() {
        assert_eq!(Event::join_room("a", "b").kind(), EventKind::JoinRoom);
        assert_eq!(Event::send_message("hi").kind(), EventKind::SendMessage);
        assert_eq!(EventKind::ReceiveMessage.to_string(), "receiveMessage");
    }

    #[test]
    fn test_join_room_wire_shape() {
        let json = serde_json::to_value(Event::join_room("Alice", "lobby")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "event": "joinRoom",
                "data": { "userName": "Alice", "roomId": "lobby" }
            })
        );
    }

    #[test]
    fn test_join_room_missing_fields() {
        let event: Event =
            serde_json::from_str(r#"{"event":"joinRoom","data":{"userName":"Alice"}}"#).unwrap();
        assert_eq!(
            event,
            Event::JoinRoom(JoinRoom {
                user_name: Some("Alice".to_string()),
                room_id: None,
            })
        );
    }

    #[test]
    fn test_send_message_wire_shape() {
        let event: Event =
            serde_json::from_str(r#"{"event":"sendMessage","data":"hello"}"#).unwrap();
        assert_eq!(event, Event::send_message("hello"));
    }

    #[test]
    fn test_receive_message_wire_shape() {
        let event = Event::receive_message(ChatMessage::system("Bob left the room.", "3:04:05 PM"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "receiveMessage");
        assert_eq!(json["data"]["sender"], "System");
        assert_eq!(json["data"]["message"], "Bob left the room.");
        assert_eq!(json["data"]["time"], "3:04:05 PM");
    }

    #[test]
    fn test_unknown_event_rejected() {
        assert!(serde_json::from_str::<Event>(r#"{"event":"shout","data":"x"}"#).is_err());
    }
}
