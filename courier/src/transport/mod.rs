//! Transport boundary for `Courier`.
//!
//! Defines the [`Transport`] trait that every network channel must satisfy.
//! Concrete implementations:
//! - [`loopback::LoopbackTransport`] — in-process channel pair for tests
//! - [`websocket::WebSocketTransport`] — WebSocket client over `tokio-tungstenite`

pub mod loopback;
pub mod websocket;

use std::fmt;

/// Describes which kind of transport is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// WebSocket connection to a delivery backend.
    WebSocket,
    /// In-process loopback for testing.
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "WebSocket"),
            Self::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Errors that can occur during transport operations.
///
/// These never cross the public [`crate::Courier`] API; the client translates
/// them into [`crate::ConnectionError`] values.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed (by either side).
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The remote endpoint could not be reached.
    #[error("endpoint {0} is unreachable")]
    Unreachable(String),

    /// The configured endpoint address is not usable.
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Async duplex channel that carries whole encoded frames.
///
/// A transport is opened and closed repeatedly over the lifetime of a client:
/// every reconnection calls [`Transport::open`] again on the same value.
/// [`Transport::send`] and [`Transport::recv`] are called concurrently (the
/// client reads on a dedicated task while writing from its event loop), so
/// implementations must keep the two directions independent.
///
/// # Invariant
///
/// Each successful `recv` returns exactly one frame as written by the peer.
/// Transports that split or coalesce frames are not supported.
pub trait Transport: Send + Sync + 'static {
    /// Establish a fresh connection, replacing any previous one.
    fn open(&self) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Close the current connection. Closing an already-closed transport is a no-op.
    fn close(&self) -> impl std::future::Future<Output = ()> + Send;

    /// Write one frame.
    ///
    /// Returns `Ok(())` once the frame has been handed to the underlying
    /// channel. This does NOT guarantee delivery; acknowledgment is handled
    /// at the protocol level.
    fn send(
        &self,
        frame: &[u8],
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next frame.
    ///
    /// Resolves with [`TransportError::ConnectionClosed`] once the
    /// connection ends; any other error also ends the connection.
    fn recv(&self) -> impl std::future::Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Whether a connection is currently open.
    fn is_open(&self) -> bool;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}
