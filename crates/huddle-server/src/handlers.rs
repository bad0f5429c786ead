//! Connection handlers for the Huddle server.
//!
//! This module builds the HTTP router and drives each WebSocket
//! connection: decoding inbound events, feeding them to the relay and
//! writing the connection's outbox back to the socket.

use crate::auth::TokenIssuer;
use crate::config::Config;
use crate::metrics::{self, Direction, DropReason};
use crate::users::{self, MemoryUserStore, UserService};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use huddle_core::{Outbox, Relay, RelayEvent};
use huddle_protocol::{codec, Encoding, Event, EventKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{interval_at, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The room relay.
    pub relay: Relay,
    /// User registration.
    pub users: UserService,
    /// Token signing and verification.
    pub tokens: TokenIssuer,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            relay: Relay::with_config(config.relay_config()),
            users: UserService::new(Arc::new(MemoryUserStore::new())),
            tokens: TokenIssuer::new(
                config.auth.jwt_secret.as_bytes(),
                Duration::from_secs(config.auth.token_ttl_secs),
            ),
            config,
        }
    }
}

/// Build the HTTP router.
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .nest("/users", users::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the server fails
/// to start.
pub async fn run_server(config: Config) -> Result<()> {
    config.validate()?;
    if config.uses_dev_secret() {
        warn!("JWT_SECRET is not set; signing tokens with the development secret");
    }

    if config.metrics.enabled {
        if let Err(e) = metrics::install_exporter(&config.metrics) {
            error!("Failed to start metrics exporter: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let ws_path = config.transport.websocket_path.clone();
    let state = Arc::new(AppState::new(config));
    let app = build_app(state);

    let listener = TcpListener::bind(addr).await?;

    info!("Huddle server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.relay.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "rooms": stats.room_count,
        "connections": stats.connection_count,
    }))
}

/// WebSocket upgrade handler.
///
/// `max_connections` is checked before the upgrade, so concurrent
/// upgrades may overshoot it slightly.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if state.relay.connection_count() >= state.config.limits.max_connections {
        warn!("Connection limit reached, refusing upgrade");
        metrics::frame_dropped(DropReason::ConnectionLimit);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// A connection's registration with the relay.
///
/// Dropping the session disconnects it from the relay, so the departure
/// is announced on every exit path of the connection task, unwinding
/// included.
struct Session {
    state: Arc<AppState>,
    connection_id: String,
}

impl Session {
    fn open(state: Arc<AppState>) -> (Self, Outbox) {
        let connection_id = format!("conn_{}", uuid::Uuid::new_v4().simple());
        let outbox = state.relay.connect(connection_id.clone());
        metrics::connection_opened();
        debug!(connection = %connection_id, "WebSocket connected");

        (
            Self {
                state,
                connection_id,
            },
            outbox,
        )
    }

    fn id(&self) -> &str {
        &self.connection_id
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let start = Instant::now();
        let result = self
            .state
            .relay
            .handle(&self.connection_id, RelayEvent::Disconnect);
        metrics::relay_event("disconnect", &result, start.elapsed());

        match result {
            Ok(recipients) => {
                debug!(connection = %self.connection_id, recipients, "Announced departure");
            }
            Err(e) => debug!(connection = %self.connection_id, reason = %e, "Silent disconnect"),
        }

        metrics::relay_snapshot(&self.state.relay.stats());
        metrics::connection_closed();
        debug!(connection = %self.connection_id, "WebSocket disconnected");
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (session, mut outbox) = Session::open(Arc::clone(&state));
    let connection_id = session.id();

    let (mut sender, mut receiver) = socket.split();

    // Replies follow the encoding of the last inbound frame.
    let mut encoding = Encoding::default();
    let mut read_buffer = BytesMut::with_capacity(4096);
    let max_message_size = state.config.limits.max_message_size;

    let heartbeat = Duration::from_millis(state.config.heartbeat.interval_ms.max(1));
    let grace = heartbeat + Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            // Broadcasts queued by the relay for this connection
            Some(message) = outbox.recv() => {
                let event = Event::receive_message(message.as_ref().clone());
                if let Err(e) = send_event(&mut sender, &event, encoding).await {
                    debug!(connection = %connection_id, error = %e, "Failed to write event");
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > max_message_size {
                            warn!(connection = %connection_id, size = text.len(), "Dropping oversized message");
                            metrics::frame_dropped(DropReason::Oversized);
                            continue;
                        }
                        encoding = Encoding::Json;
                        metrics::frame(Direction::Inbound, encoding, text.len());
                        match codec::decode_json(&text) {
                            Ok(event) => dispatch(&state, connection_id, event),
                            Err(e) => {
                                debug!(connection = %connection_id, error = %e, "Undecodable text frame");
                                metrics::frame_dropped(DropReason::Undecodable);
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if read_buffer.len() + data.len() > max_message_size {
                            warn!(connection = %connection_id, size = data.len(), "Dropping oversized message");
                            metrics::frame_dropped(DropReason::Oversized);
                            read_buffer.clear();
                            continue;
                        }
                        encoding = Encoding::MessagePack;
                        metrics::frame(Direction::Inbound, encoding, data.len());
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(event)) => dispatch(&state, connection_id, event),
                                Ok(None) => break,
                                Err(e) => {
                                    debug!(connection = %connection_id, error = %e, "Undecodable binary frame");
                                    metrics::frame_dropped(DropReason::Undecodable);
                                    read_buffer.clear();
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::frame_dropped(DropReason::SocketError);
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if last_seen.elapsed() > grace {
                    info!(connection = %connection_id, "Heartbeat timeout");
                    metrics::heartbeat_timeout();
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Feed a decoded event to the relay.
fn dispatch(state: &AppState, connection_id: &str, event: Event) {
    let kind = event.kind();
    let relay_event = match RelayEvent::try_from(event) {
        Ok(relay_event) => relay_event,
        Err(kind) => {
            warn!(connection = %connection_id, event = %kind, "Unexpected client event");
            metrics::frame_dropped(DropReason::UnexpectedEvent);
            return;
        }
    };

    let start = Instant::now();
    let result = state.relay.handle(connection_id, relay_event);
    metrics::relay_event(kind.as_str(), &result, start.elapsed());

    match result {
        Ok(recipients) => {
            if kind == EventKind::JoinRoom {
                metrics::relay_snapshot(&state.relay.stats());
            }
            debug!(connection = %connection_id, event = %kind, recipients, "Handled event");
        }
        Err(e) => {
            debug!(connection = %connection_id, event = %kind, reason = %e, "Dropped event");
        }
    }
}

/// Send an event to the WebSocket in the connection's encoding.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &Event,
    encoding: Encoding,
) -> Result<()> {
    let (message, size) = match encoding {
        Encoding::Json => {
            let text = codec::encode_json(event)?;
            let size = text.len();
            (Message::Text(text), size)
        }
        Encoding::MessagePack => {
            let data = codec::encode(event)?.to_vec();
            let size = data.len();
            (Message::Binary(data), size)
        }
    };
    metrics::frame(Direction::Outbound, encoding, size);
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use huddle_protocol::ChatMessage;
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn spawn_server() -> (SocketAddr, Arc<AppState>) {
        spawn_server_with(Config::default()).await
    }

    async fn spawn_server_with(config: Config) -> (SocketAddr, Arc<AppState>) {
        let state = Arc::new(AppState::new(config));
        let app = build_app(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        client
    }

    async fn send_json(client: &mut Client, event: Event) {
        let text = codec::encode_json(&event).unwrap();
        client.send(WsMessage::Text(text)).await.unwrap();
    }

    async fn recv_chat(client: &mut Client) -> ChatMessage {
        let deadline = Duration::from_secs(5);
        loop {
            let frame = tokio::time::timeout(deadline, client.next())
                .await
                .expect("timed out waiting for a message")
                .expect("stream ended")
                .unwrap();
            let event = match frame {
                WsMessage::Text(text) => codec::decode_json(&text).unwrap(),
                WsMessage::Binary(data) => codec::decode(&data).unwrap(),
                _ => continue,
            };
            match event {
                Event::ReceiveMessage(message) => return message,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    fn said(message: &ChatMessage) -> (&str, &str) {
        (message.sender.as_str(), message.message.as_str())
    }

    async fn eventually(condition: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_lobby_scenario_over_websocket() {
        let (addr, state) = spawn_server().await;
        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;

        send_json(&mut alice, Event::join_room("Alice", "lobby")).await;
        assert_eq!(said(&recv_chat(&mut alice).await), ("System", "Alice joined the room."));

        send_json(&mut bob, Event::join_room("Bob", "lobby")).await;
        assert_eq!(said(&recv_chat(&mut alice).await), ("System", "Bob joined the room."));
        assert_eq!(said(&recv_chat(&mut bob).await), ("System", "Bob joined the room."));

        send_json(&mut bob, Event::send_message("hi")).await;
        assert_eq!(said(&recv_chat(&mut alice).await), ("Bob", "hi"));
        assert_eq!(said(&recv_chat(&mut bob).await), ("Bob", "hi"));

        bob.close(None).await.unwrap();
        assert_eq!(said(&recv_chat(&mut alice).await), ("System", "Bob left the room."));
        assert_eq!(state.relay.member_count("lobby"), 1);
    }

    #[tokio::test]
    async fn test_send_before_join_is_dropped() {
        let (addr, _state) = spawn_server().await;
        let mut client = connect(addr).await;

        send_json(&mut client, Event::send_message("anyone?")).await;
        send_json(&mut client, Event::join_room("Carol", "den")).await;

        let first = recv_chat(&mut client).await;
        assert_eq!(said(&first), ("System", "Carol joined the room."));
        assert!(!first.time.is_empty());
    }

    #[tokio::test]
    async fn test_garbage_frames_are_ignored() {
        let (addr, _state) = spawn_server().await;
        let mut client = connect(addr).await;

        client.send(WsMessage::Text("{not json".to_string())).await.unwrap();
        send_json(&mut client, Event::receive_message(ChatMessage::system("spoof", "now"))).await;
        send_json(&mut client, Event::join_room("Dave", "den")).await;

        assert_eq!(said(&recv_chat(&mut client).await), ("System", "Dave joined the room."));
    }

    #[tokio::test]
    async fn test_binary_clients_get_binary_replies() {
        let (addr, _state) = spawn_server().await;
        let mut client = connect(addr).await;

        let join = codec::encode(&Event::join_room("Erin", "bits")).unwrap();
        client.send(WsMessage::Binary(join.to_vec())).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let WsMessage::Binary(data) = frame else {
            panic!("expected a binary frame, got {frame:?}");
        };
        let Event::ReceiveMessage(message) = codec::decode(&data).unwrap() else {
            panic!("expected receiveMessage");
        };
        assert_eq!(said(&message), ("System", "Erin joined the room."));
    }

    #[tokio::test]
    async fn test_disconnect_before_join_leaves_no_trace() {
        let (addr, state) = spawn_server().await;
        let mut client = connect(addr).await;
        client.close(None).await.unwrap();

        assert!(eventually(|| state.relay.connection_count() == 0).await);
        assert!(state.relay.room_ids().is_empty());
    }

    #[tokio::test]
    async fn test_nameless_join_only_listens() {
        let (addr, state) = spawn_server().await;
        let mut alice = connect(addr).await;
        let mut listener = connect(addr).await;

        send_json(&mut alice, Event::join_room("Alice", "lobby")).await;
        assert_eq!(said(&recv_chat(&mut alice).await), ("System", "Alice joined the room."));

        let join = r#"{"event":"joinRoom","data":{"roomId":"lobby"}}"#;
        listener.send(WsMessage::Text(join.to_string())).await.unwrap();
        assert!(eventually(|| state.relay.member_count("lobby") == 2).await);

        send_json(&mut listener, Event::send_message("psst")).await;
        send_json(&mut alice, Event::send_message("hello")).await;

        assert_eq!(said(&recv_chat(&mut listener).await), ("Alice", "hello"));
        assert_eq!(said(&recv_chat(&mut alice).await), ("Alice", "hello"));
    }

    #[tokio::test]
    async fn test_silent_client_is_dropped_after_heartbeat_timeout() {
        let mut config = Config::default();
        config.heartbeat.interval_ms = 100;
        config.heartbeat.timeout_ms = 100;
        let (addr, state) = spawn_server_with(config).await;

        // Never read again after joining, so server pings go unanswered.
        let mut silent = connect(addr).await;
        send_json(&mut silent, Event::join_room("Sam", "lobby")).await;
        assert!(eventually(|| state.relay.member_count("lobby") == 1).await);

        // Reading answers pings, which keeps this one alive.
        let mut bob = connect(addr).await;
        send_json(&mut bob, Event::join_room("Bob", "lobby")).await;
        assert_eq!(said(&recv_chat(&mut bob).await), ("System", "Bob joined the room."));
        assert_eq!(said(&recv_chat(&mut bob).await), ("System", "Sam left the room."));

        assert_eq!(state.relay.connection_count(), 1);
        assert_eq!(state.relay.member_count("lobby"), 1);
        drop(silent);
    }

    #[tokio::test]
    async fn test_session_teardown_runs_when_task_panics() {
        let state = Arc::new(AppState::new(Config::default()));
        let mut peer = state.relay.connect("conn-peer");
        state.relay.join("conn-peer", "Pat", "lobby").unwrap();

        let task_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            let (session, _outbox) = Session::open(Arc::clone(&task_state));
            task_state.relay.join(session.id(), "Quinn", "lobby").unwrap();
            panic!("connection task failed");
        });
        assert!(task.await.unwrap_err().is_panic());

        assert_eq!(state.relay.connection_count(), 1);
        assert_eq!(state.relay.members("lobby"), vec!["conn-peer".to_string()]);

        let notices: Vec<String> = std::iter::from_fn(|| peer.try_recv().ok())
            .map(|message| message.message.clone())
            .collect();
        assert_eq!(
            notices,
            vec![
                "Pat joined the room.",
                "Quinn joined the room.",
                "Quinn left the room.",
            ]
        );
    }

    #[tokio::test]
    async fn test_health() {
        let (addr, _state) = spawn_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""status":"ok""#));
    }
}
