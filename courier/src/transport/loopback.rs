//! Loopback transport for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels to simulate a delivery
//! backend. Created via [`LoopbackTransport::create_pair`], which returns the
//! client-side transport and a [`LoopbackPeer`] playing the server. Every
//! [`Transport::open`] produces a fresh session on the peer side, so tests can
//! sever a connection and watch the client reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use courier_proto::codec;
use courier_proto::frame::{Frame, MessageId};
use tokio::sync::{Mutex, mpsc};

use super::{Transport, TransportError, TransportType};

/// How the peer answers the next [`Transport::open`] calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenBehavior {
    /// Accept the connection and start a new session.
    #[default]
    Accept,
    /// Fail immediately with [`TransportError::Unreachable`].
    Refuse,
    /// Never complete; the client's connection timeout must fire.
    Stall,
}

/// Settings shared between the transport and its peer.
#[derive(Debug, Default)]
struct Control {
    behavior: parking_lot::Mutex<OpenBehavior>,
    opens: AtomicUsize,
    /// While set, client writes never complete.
    stall_writes: AtomicBool,
}

/// One accepted connection as seen from the peer side.
struct Session {
    /// Peer → client frames.
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    /// Client → peer frames.
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Client-side in-process transport.
pub struct LoopbackTransport {
    control: Arc<Control>,
    /// Hands new sessions to the peer. Dropping the transport closes it.
    sessions: mpsc::UnboundedSender<Session>,
    tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

/// Server side of a [`LoopbackTransport`].
pub struct LoopbackPeer {
    control: Arc<Control>,
    sessions: mpsc::UnboundedReceiver<Session>,
    current: Option<Session>,
}

impl LoopbackTransport {
    /// Create a transport and the peer that answers it.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use courier::transport::Transport;
    /// use courier::transport::loopback::LoopbackTransport;
    ///
    /// # async fn example() {
    /// let (transport, mut peer) = LoopbackTransport::create_pair();
    /// transport.open().await.unwrap();
    /// transport.send(br#"{"type":"ping","id":"p1"}"#).await.unwrap();
    /// let frame = peer.next_frame().await.unwrap();
    /// assert_eq!(frame.id().as_str(), "p1");
    /// # }
    /// ```
    #[must_use]
    pub fn create_pair() -> (Self, LoopbackPeer) {
        let control = Arc::new(Control::default());
        let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
        let transport = Self {
            control: Arc::clone(&control),
            sessions: sessions_tx,
            tx: parking_lot::Mutex::new(None),
            rx: Mutex::new(None),
        };
        let peer = LoopbackPeer {
            control,
            sessions: sessions_rx,
            current: None,
        };
        (transport, peer)
    }
}

impl Transport for LoopbackTransport {
    async fn open(&self) -> Result<(), TransportError> {
        self.control.opens.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.control.behavior.lock();
        match behavior {
            OpenBehavior::Accept => {}
            OpenBehavior::Refuse => {
                return Err(TransportError::Unreachable("loopback peer".into()));
            }
            OpenBehavior::Stall => std::future::pending::<()>().await,
        }

        let (to_peer, from_client) = mpsc::unbounded_channel();
        let (to_client, from_peer) = mpsc::unbounded_channel();
        self.sessions
            .send(Session {
                outbound: to_client,
                inbound: from_client,
            })
            .map_err(|_| TransportError::Unreachable("loopback peer".into()))?;

        *self.tx.lock() = Some(to_peer);
        *self.rx.lock().await = Some(from_peer);
        Ok(())
    }

    async fn close(&self) {
        self.tx.lock().take();
        self.rx.lock().await.take();
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.control.stall_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame.to_vec())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.rx.lock().await;
        let rx = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        self.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}

impl LoopbackPeer {
    /// Change how subsequent connection attempts are answered.
    pub fn set_open_behavior(&self, behavior: OpenBehavior) {
        *self.control.behavior.lock() = behavior;
    }

    /// Make client writes hang, as a peer that stops reading would.
    /// Only writes started after the call are affected.
    pub fn set_write_stall(&self, stalled: bool) {
        self.control.stall_writes.store(stalled, Ordering::SeqCst);
    }

    /// Number of times the client has called [`Transport::open`].
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.control.opens.load(Ordering::SeqCst)
    }

    /// Whether a session is active and the client side still holds it.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|session| !session.outbound.is_closed())
    }

    /// Wait for the client to open a new session and make it current.
    ///
    /// Returns `false` if the transport was dropped.
    pub async fn accept(&mut self) -> bool {
        match self.sessions.recv().await {
            Some(session) => {
                self.current = Some(session);
                true
            }
            None => false,
        }
    }

    /// Next raw frame written by the client, following the client across
    /// reconnections.
    ///
    /// Returns `None` once the transport is dropped.
    pub async fn next_raw(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.current.is_none() && !self.accept().await {
                return None;
            }
            let session = self.current.as_mut()?;
            match session.inbound.recv().await {
                Some(bytes) => return Some(bytes),
                None => self.current = None,
            }
        }
    }

    /// Next decodable frame written by the client. Undecodable bytes are skipped.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let bytes = self.next_raw().await?;
            match codec::decode(&bytes) {
                Ok(frame) => return Some(frame),
                Err(e) => tracing::warn!(error = %e, "loopback peer skipping undecodable frame"),
            }
        }
    }

    /// Deliver raw bytes to the client on the current session.
    ///
    /// Returns `false` if no session is active.
    pub fn send_raw(&self, bytes: Vec<u8>) -> bool {
        self.current
            .as_ref()
            .is_some_and(|session| session.outbound.send(bytes).is_ok())
    }

    /// Deliver a frame to the client on the current session.
    pub fn send(&self, frame: &Frame) -> bool {
        codec::encode(frame).is_ok_and(|bytes| self.send_raw(bytes))
    }

    /// Acknowledge the message with the given id.
    pub fn ack(&self, id: &MessageId) -> bool {
        self.send(&Frame::ack(id.clone()))
    }

    /// Drop the current session without a close handshake, as a network
    /// failure would.
    pub fn sever(&mut self) {
        self.current = None;
    }
}
