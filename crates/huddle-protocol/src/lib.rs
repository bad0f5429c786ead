//! # huddle-protocol
//!
//! Wire events for the Huddle chat relay.
//!
//! Every message on a Huddle socket is an [`Event`]: a named event with a
//! payload, shaped as `{"event": "<name>", "data": <payload>}`.
//!
//! ## Events
//!
//! - `joinRoom` - Enter a room under a display name (client -> server)
//! - `sendMessage` - Post a message to the current room (client -> server)
//! - `receiveMessage` - A chat line or system notice (server -> client)
//!
//! ## Encodings
//!
//! Text frames carry JSON. Binary frames carry MessagePack behind a 4-byte
//! length prefix.
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, Event};
//!
//! let event = Event::join_room("Alice", "lobby");
//!
//! let text = codec::encode_json(&event).unwrap();
//! assert_eq!(codec::decode_json(&text).unwrap(), event);
//!
//! let binary = codec::encode(&event).unwrap();
//! assert_eq!(codec::decode(&binary).unwrap(), event);
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, decode_json, encode, encode_json, Encoding, ProtocolError};
pub use events::{ChatMessage, Event, EventKind, JoinRoom, SYSTEM_SENDER};
