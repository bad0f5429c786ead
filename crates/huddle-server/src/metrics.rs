//! Prometheus metrics for the relay and the users API.
//!
//! Recording goes through the `metrics` facade, so every function here is
//! a no-op until [`install_exporter`] has installed a recorder.

use crate::config::MetricsConfig;
use huddle_core::{RelayError, RelayStats};
use huddle_protocol::Encoding;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_OPENED: &str = "huddle_connections_opened_total";
    pub const CONNECTIONS_OPEN: &str = "huddle_connections_open";
    pub const CONNECTIONS_JOINED: &str = "huddle_connections_joined";
    pub const ROOMS_LIVE: &str = "huddle_rooms_live";
    pub const FRAMES: &str = "huddle_frames_total";
    pub const FRAME_BYTES: &str = "huddle_frame_bytes_total";
    pub const FRAMES_DROPPED: &str = "huddle_frames_dropped_total";
    pub const RELAY_EVENTS: &str = "huddle_relay_events_total";
    pub const RELAY_DURATION: &str = "huddle_relay_duration_seconds";
    pub const BROADCAST_RECIPIENTS: &str = "huddle_broadcast_recipients";
    pub const HEARTBEAT_TIMEOUTS: &str = "huddle_heartbeat_timeouts_total";
    pub const USERS_REGISTERED: &str = "huddle_users_registered_total";
}

/// Frame direction on a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Why an inbound frame or upgrade was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Oversized,
    Undecodable,
    UnexpectedEvent,
    SocketError,
    ConnectionLimit,
}

impl DropReason {
    fn as_str(self) -> &'static str {
        match self {
            DropReason::Oversized => "oversized",
            DropReason::Undecodable => "undecodable",
            DropReason::UnexpectedEvent => "unexpected_event",
            DropReason::SocketError => "socket_error",
            DropReason::ConnectionLimit => "connection_limit",
        }
    }
}

/// Label for the result of a relay operation.
fn outcome(result: &Result<usize, RelayError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(RelayError::MissingRoom) => "missing_room",
        Err(RelayError::InvalidRoom(_)) => "invalid_room",
        Err(RelayError::NotInRoom(_)) => "not_in_room",
        Err(RelayError::Nameless(_)) => "nameless",
        Err(RelayError::UnknownConnection(_)) => "unknown_connection",
        Err(RelayError::RoomLimitReached) => "room_limit",
    }
}

/// Register descriptions for every metric.
pub fn describe() {
    metrics::describe_counter!(names::CONNECTIONS_OPENED, "WebSocket connections accepted");
    metrics::describe_gauge!(names::CONNECTIONS_OPEN, "WebSocket connections currently open");
    metrics::describe_gauge!(names::CONNECTIONS_JOINED, "Connections currently in a room");
    metrics::describe_gauge!(names::ROOMS_LIVE, "Rooms with at least one member");
    metrics::describe_counter!(names::FRAMES, "Socket frames by direction and encoding");
    metrics::describe_counter!(names::FRAME_BYTES, "Socket frame payload bytes");
    metrics::describe_counter!(names::FRAMES_DROPPED, "Inbound frames or upgrades discarded");
    metrics::describe_counter!(names::RELAY_EVENTS, "Relay operations by event and outcome");
    metrics::describe_histogram!(names::RELAY_DURATION, "Relay operation time in seconds");
    metrics::describe_histogram!(
        names::BROADCAST_RECIPIENTS,
        "Connections a broadcast was queued for"
    );
    metrics::describe_counter!(
        names::HEARTBEAT_TIMEOUTS,
        "Connections dropped for missing heartbeats"
    );
    metrics::describe_counter!(names::USERS_REGISTERED, "Users registered");
}

/// Install the Prometheus recorder and its scrape listener.
///
/// # Errors
///
/// Returns an error if the recorder is already installed or the listener
/// cannot bind.
pub fn install_exporter(config: &MetricsConfig) -> anyhow::Result<SocketAddr> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe();

    info!("Metrics exporter listening on {}", addr);
    Ok(addr)
}

pub fn connection_opened() {
    counter!(names::CONNECTIONS_OPENED).increment(1);
    gauge!(names::CONNECTIONS_OPEN).increment(1.0);
}

pub fn connection_closed() {
    gauge!(names::CONNECTIONS_OPEN).decrement(1.0);
}

/// Count one socket frame.
pub fn frame(direction: Direction, encoding: Encoding, bytes: usize) {
    let (direction, encoding) = (direction.as_str(), encoding.as_str());
    counter!(names::FRAMES, "direction" => direction, "encoding" => encoding).increment(1);
    counter!(names::FRAME_BYTES, "direction" => direction, "encoding" => encoding)
        .increment(bytes as u64);
}

pub fn frame_dropped(reason: DropReason) {
    counter!(names::FRAMES_DROPPED, "reason" => reason.as_str()).increment(1);
}

/// Record a relay operation and, when it broadcast, its fan-out.
pub fn relay_event(event: &'static str, result: &Result<usize, RelayError>, elapsed: Duration) {
    counter!(names::RELAY_EVENTS, "event" => event, "outcome" => outcome(result)).increment(1);
    histogram!(names::RELAY_DURATION, "event" => event).record(elapsed.as_secs_f64());
    if let Ok(recipients) = result {
        histogram!(names::BROADCAST_RECIPIENTS, "event" => event).record(*recipients as f64);
    }
}

/// Publish room and membership gauges.
pub fn relay_snapshot(stats: &RelayStats) {
    gauge!(names::ROOMS_LIVE).set(stats.room_count as f64);
    gauge!(names::CONNECTIONS_JOINED).set(stats.joined_count as f64);
}

pub fn heartbeat_timeout() {
    counter!(names::HEARTBEAT_TIMEOUTS).increment(1);
}

pub fn user_registered() {
    counter!(names::USERS_REGISTERED).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome(&Ok(3)), "ok");
        assert_eq!(outcome(&Err(RelayError::MissingRoom)), "missing_room");
        assert_eq!(
            outcome(&Err(RelayError::Nameless("conn-1".to_string()))),
            "nameless"
        );
        assert_eq!(outcome(&Err(RelayError::RoomLimitReached)), "room_limit");
    }

    #[test]
    fn test_recording_without_recorder() {
        connection_opened();
        frame(Direction::Inbound, Encoding::MessagePack, 42);
        frame_dropped(DropReason::Undecodable);
        relay_event("joinRoom", &Ok(2), Duration::from_micros(5));
        relay_snapshot(&RelayStats {
            room_count: 1,
            connection_count: 2,
            joined_count: 2,
        });
        connection_closed();
    }
}
