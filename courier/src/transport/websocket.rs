//! WebSocket transport for `Courier`.
//!
//! Implements the [`Transport`] trait over `tokio-tungstenite`. Frames are
//! written as text messages (JSON is always valid UTF-8); binary messages from
//! the server are accepted as well. WebSocket-level ping/pong control frames
//! are handled by tungstenite and never surface as frames.

use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Transport, TransportError, TransportType};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// WebSocket client transport implementing the [`Transport`] trait.
///
/// Holds no connection until [`Transport::open`] is called. Each `open`
/// performs a fresh handshake and replaces both halves of the previous
/// connection.
pub struct WebSocketTransport {
    /// The server URL (ws:// or wss://).
    url: String,
    ws_sender: Mutex<Option<WsSender>>,
    ws_reader: Mutex<Option<WsReader>>,
    connected: AtomicBool,
}

impl WebSocketTransport {
    /// Create a transport for the given WebSocket URL.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if the URL does not parse or
    /// its scheme is not `ws`/`wss`.
    pub fn new(url: &str) -> Result<Self, TransportError> {
        let parsed =
            url::Url::parse(url).map_err(|e| TransportError::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidUrl(format!(
                "{url}: unsupported scheme '{}'",
                parsed.scheme()
            )));
        }
        Ok(Self {
            url: url.to_string(),
            ws_sender: Mutex::new(None),
            ws_reader: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    /// Return the server URL this transport connects to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<(), TransportError> {
        let (ws_stream, _response) = connect_async(self.url.as_str()).await.map_err(|e| {
            tracing::warn!(url = %self.url, err = %e, "WebSocket connect failed");
            map_ws_connect_error(&self.url, e)
        })?;

        let (sender, reader) = ws_stream.split();
        *self.ws_sender.lock().await = Some(sender);
        *self.ws_reader.lock().await = Some(reader);
        self.connected.store(true, Ordering::Relaxed);
        tracing::debug!(url = %self.url, "WebSocket connection established");
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        if let Some(mut sender) = self.ws_sender.lock().await.take() {
            // Best effort: the peer may already be gone.
            let _ = sender.send(Message::Close(None)).await;
            let _ = sender.close().await;
        }
        self.ws_reader.lock().await.take();
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let message = match std::str::from_utf8(frame) {
            Ok(text) => Message::Text(text.to_owned().into()),
            Err(_) => Message::Binary(frame.to_vec().into()),
        };

        let mut guard = self.ws_sender.lock().await;
        let sender = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;
        sender.send(message).await.map_err(|e| {
            tracing::warn!(err = %e, "WebSocket send failed");
            self.connected.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.ws_reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().as_bytes().to_vec()),
                Some(Ok(Message::Binary(data))) => return Ok(data.to_vec()),
                Some(Ok(Message::Close(_))) => {
                    tracing::info!(url = %self.url, "WebSocket closed by server");
                    break;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => {
                    tracing::warn!(err = %e, "WebSocket read error");
                    self.connected.store(false, Ordering::Relaxed);
                    return Err(TransportError::Io(std::io::Error::other(e.to_string())));
                }
                None => break,
            }
        }
        self.connected.store(false, Ordering::Relaxed);
        Err(TransportError::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }
}

/// Map a tungstenite connect error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Tls(_) => TransportError::Io(std::io::Error::other(format!("TLS error: {err}"))),
        WsError::Http(response) => TransportError::Io(std::io::Error::other(format!(
            "HTTP error during upgrade: status {}",
            response.status()
        ))),
        other => TransportError::Io(std::io::Error::other(format!(
            "WebSocket connection error: {other}"
        ))),
    }
}
