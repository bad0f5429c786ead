//! # huddle-core
//!
//! Room-based message relay for the Huddle chat server.
//!
//! This crate provides the building blocks:
//!
//! - **Registry** - Live connections and the name/room attached to each
//! - **Directory** - Rooms and their members, created on first join
//! - **Relay** - Join, send and disconnect handling with room-wide broadcast
//! - **Message** - Notice text and server timestamps
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│    Relay    │────▶│  Directory  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │                   ▼
//!        │            ┌─────────────┐
//!        └────────────│  Registry   │
//!          outbox     └─────────────┘
//! ```

pub mod message;
pub mod registry;
pub mod relay;
pub mod room;

pub use message::{time_of_day, DEFAULT_TIME_FORMAT};
pub use registry::{ConnectionId, ConnectionInfo, Outbox, Registry};
pub use relay::{Relay, RelayConfig, RelayError, RelayEvent, RelayStats};
pub use room::{Directory, Room, RoomId};
