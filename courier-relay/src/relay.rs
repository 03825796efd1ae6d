//! Relay server core: shared state, WebSocket handler, and message fan-out.
//!
//! Every connection is a client speaking the JSON frame protocol. The relay
//! acknowledges each `message` frame back to its sender, forwards it
//! unchanged to every other connected client, and answers `ping` with
//! `pong`. Malformed and oversized frames are dropped without closing the
//! socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use courier_proto::codec::{self, MAX_FRAME_SIZE};
use courier_proto::frame::Frame;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

/// Identifies one connection to the relay.
pub type ConnectionId = u64;

/// Shared relay server state holding the connection registry.
pub struct RelayState {
    /// Maps connection id to a channel sender for its WebSocket writer.
    connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Message>>>,
    next_id: AtomicU64,
    /// Maximum accepted frame size in bytes.
    max_payload_size: usize,
    /// Whether `message` frames are acknowledged. Tests switch this off to
    /// simulate a backend that loses acks.
    acks_enabled: AtomicBool,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a relay state with the default frame size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MAX_FRAME_SIZE)
    }

    /// Creates a relay state with a custom frame size limit.
    #[must_use]
    pub fn with_config(max_payload_size: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_payload_size,
            acks_enabled: AtomicBool::new(true),
        }
    }

    /// Registers a connection and returns its id.
    pub async fn register(&self, sender: mpsc::UnboundedSender<Message>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.write().await.insert(id, sender);
        id
    }

    /// Removes a connection from the registry.
    pub async fn unregister(&self, id: ConnectionId) -> Option<mpsc::UnboundedSender<Message>> {
        self.connections.write().await.remove(&id)
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Enable or disable acknowledgments for subsequent `message` frames.
    pub fn set_acks_enabled(&self, enabled: bool) {
        self.acks_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Send a WebSocket Close frame to all connected clients.
    ///
    /// This causes each connection's writer task to send a close frame,
    /// which the client reader sees as a disconnect. Useful for graceful
    /// shutdown and testing.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (id, sender) in conns.iter() {
            tracing::info!(connection = id, "sending close frame");
            let _ = sender.send(Message::Close(None));
        }
    }

    /// Queue `message` for every connection except `from`.
    async fn broadcast(&self, from: ConnectionId, message: &Message) -> usize {
        let conns = self.connections.read().await;
        conns
            .iter()
            .filter(|(id, _)| **id != from)
            .filter(|(_, sender)| sender.send(message.clone()).is_ok())
            .count()
    }
}

/// Handles an upgraded WebSocket connection for a single client.
///
/// The connection lifecycle:
/// 1. Register the connection.
/// 2. Forward queued outbound frames from a writer task.
/// 3. Process inbound frames until the socket closes.
/// 4. Unregister the connection.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let id = state.register(tx.clone()).await;
    tracing::info!(connection = id, "client connected");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(connection = id, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let data = match &msg {
                Message::Text(text) => text.as_str().as_bytes(),
                Message::Binary(data) => data.as_ref(),
                Message::Close(_) => {
                    tracing::info!(connection = id, "received close frame");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            handle_frame(id, data, &tx, &reader_state).await;
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(id).await;
    tracing::info!(connection = id, "client disconnected");
}

/// Handles one inbound frame from connection `id`.
async fn handle_frame(
    id: ConnectionId,
    data: &[u8],
    reply: &mpsc::UnboundedSender<Message>,
    state: &RelayState,
) {
    let frame = match codec::decode_bounded(data, state.max_payload_size) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(connection = id, size = data.len(), error = %e, "dropping frame");
            return;
        }
    };

    match frame {
        Frame::Message { id: message_id, .. } => {
            let forwarded = state.broadcast(id, &text_message(data)).await;
            tracing::debug!(
                connection = id,
                message_id = %message_id,
                forwarded,
                "message relayed"
            );
            if state.acks_enabled.load(Ordering::Relaxed) {
                send_frame(reply, &Frame::ack(message_id));
            } else {
                tracing::debug!(connection = id, message_id = %message_id, "ack suppressed");
            }
        }
        Frame::Ping { id: probe_id, .. } => send_frame(reply, &Frame::pong(probe_id)),
        Frame::Ack { id: message_id, .. } => {
            tracing::debug!(connection = id, message_id = %message_id, "client acknowledged");
        }
        Frame::Pong { id: probe_id, .. } => {
            tracing::debug!(connection = id, probe_id = %probe_id, "unsolicited pong");
        }
    }
}

/// Wrap raw frame bytes as a WebSocket text message.
fn text_message(data: &[u8]) -> Message {
    Message::Text(String::from_utf8_lossy(data).into_owned().into())
}

/// Encodes and queues a frame for the connection's writer.
fn send_frame(sender: &mpsc::UnboundedSender<Message>, frame: &Frame) {
    match codec::encode(frame) {
        Ok(bytes) => {
            let _ = sender.send(text_message(&bytes));
        }
        Err(e) => tracing::warn!(kind = %frame.kind(), error = %e, "failed to encode frame"),
    }
}

/// Starts the relay server on the given address and returns the bound address
/// and a join handle.
///
/// This is the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// Keep a clone of the `Arc` to inspect or control the relay while it runs.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// Axum handler that upgrades HTTP to WebSocket.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
