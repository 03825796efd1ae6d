//! The public [`Courier`] handle.
//!
//! A `Courier` is a cheap, cloneable handle to a background task that owns
//! all delivery state (connection, in-flight waiters, offline queue,
//! heartbeat, timers). Every method sends a command to that task and, where
//! there is an answer, waits for it. Dropping the last handle shuts the task
//! down.
//!
//! ```rust,no_run
//! use courier::transport::websocket::WebSocketTransport;
//! use courier::{Courier, CourierConfig, OutboundMessage};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = WebSocketTransport::new("ws://127.0.0.1:9000/ws")?;
//! let (courier, _dispatch_errors) = Courier::new(transport, CourierConfig::default())?;
//! courier.connect().await?;
//! let ack = courier.send(OutboundMessage::text("m1", "hello")).await?;
//! println!("acknowledged after {:?}", ack.latency);
//! # Ok(())
//! # }
//! ```

mod actor;
mod inbound;
mod outbound;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::{ConfigError, CourierConfig};
use crate::connection::{ConnectionError, ConnectionState};
use crate::delivery::{AckResult, DeliveryError, OutboundMessage};
use crate::dispatch::{
    DispatchError, Handler, HandlerError, InboundMessage, StateChange, SubscriberId,
};
use crate::stats::ConnectionStats;
use crate::transport::Transport;
use courier_proto::frame::MessageId;

use actor::Actor;

/// Why a [`Courier::connect`] call did not reach CONNECTED.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The attempt failed. Automatic reconnection continues unless the
    /// error is fatal.
    #[error("connection attempt failed: {0}")]
    Failed(#[from] ConnectionError),

    /// [`Courier::disconnect`] was called while the attempt was in progress.
    #[error("connection attempt cancelled by disconnect")]
    Cancelled,

    /// The client task is gone.
    #[error("client shut down")]
    Shutdown,
}

/// The client task has shut down and can no longer take commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client shut down")]
pub struct ShutdownError;

/// Messages awaiting completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Written and awaiting acknowledgment.
    pub in_flight: usize,
    /// Buffered until the next connection.
    pub queued: usize,
}

/// Completion handle for a submitted message.
#[derive(Debug)]
pub struct DeliveryReceipt {
    id: MessageId,
    rx: oneshot::Receiver<Result<AckResult, DeliveryError>>,
}

impl DeliveryReceipt {
    /// Id of the submitted message.
    #[must_use]
    pub const fn id(&self) -> &MessageId {
        &self.id
    }

    /// Wait until the message is acknowledged or permanently fails.
    ///
    /// # Errors
    ///
    /// Returns the [`DeliveryError`] the delivery was rejected with, or
    /// [`DeliveryError::Shutdown`] if the client went away first.
    pub async fn wait(self) -> Result<AckResult, DeliveryError> {
        self.rx.await.unwrap_or(Err(DeliveryError::Shutdown))
    }
}

pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send {
        message: OutboundMessage,
        reply: oneshot::Sender<Result<AckResult, DeliveryError>>,
    },
    SubscribeMessages {
        handler: Handler<InboundMessage>,
        reply: oneshot::Sender<SubscriberId>,
    },
    SubscribeState {
        handler: Handler<StateChange>,
        reply: oneshot::Sender<SubscriberId>,
    },
    Unsubscribe {
        id: SubscriberId,
        reply: oneshot::Sender<bool>,
    },
    Pending {
        reply: oneshot::Sender<PendingCounts>,
    },
    Reset {
        reply: oneshot::Sender<ConnectionStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a delivery client.
#[derive(Clone)]
pub struct Courier {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    stats: watch::Receiver<ConnectionStats>,
}

impl Courier {
    /// Spawn the client task over `transport`.
    ///
    /// Returns the handle and the receiving end of the subscriber error
    /// channel. The client starts DISCONNECTED; call [`Courier::connect`].
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `config` fails
    /// [`CourierConfig::validate`]. No task is spawned in that case.
    pub fn new<T: Transport>(
        transport: T,
        config: CourierConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DispatchError>), ConfigError> {
        config.validate()?;
        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer);
        let (actor, parts) = Actor::new(Arc::new(transport), config);
        let handle = Self {
            commands: commands_tx,
            state: parts.state,
            stats: parts.stats,
        };
        tokio::spawn(actor.run(commands_rx, parts.events, parts.timers));
        Ok((handle, parts.dispatch_errors))
    }

    /// Connect to the backend.
    ///
    /// Resolves once CONNECTED, or with the error of the first failed
    /// attempt (reconnection then continues in the background). Already
    /// connected: resolves immediately. An attempt in progress: waits for
    /// it. Waiting to reconnect, or in ERROR: cancels the backoff, resets
    /// the attempt budget, and tries now.
    ///
    /// # Errors
    ///
    /// See [`ConnectError`].
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { reply })
            .await
            .map_err(|_| ConnectError::Shutdown)?;
        rx.await.unwrap_or(Err(ConnectError::Shutdown))
    }

    /// Close the connection and stop reconnecting.
    ///
    /// In-flight messages go back to the offline queue and are sent on the
    /// next connection. Calling this when already disconnected does nothing.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Hand a message to the client without waiting for its acknowledgment.
    ///
    /// Messages are transmitted in submission order. Rejections such as
    /// [`DeliveryError::DuplicateId`] arrive through the receipt.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Shutdown`] if the client task is gone.
    pub async fn submit(&self, message: OutboundMessage) -> Result<DeliveryReceipt, DeliveryError> {
        let id = message.id.clone();
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { message, reply })
            .await
            .map_err(|_| DeliveryError::Shutdown)?;
        Ok(DeliveryReceipt { id, rx })
    }

    /// Send a message and wait for its acknowledgment.
    ///
    /// # Errors
    ///
    /// See [`DeliveryError`].
    pub async fn send(&self, message: OutboundMessage) -> Result<AckResult, DeliveryError> {
        self.submit(message).await?.wait().await
    }

    /// Register a handler for inbound application messages.
    ///
    /// Handlers run on the client task in registration order and must not
    /// block.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError`] if the client task is gone.
    pub async fn on_message<F>(&self, handler: F) -> Result<SubscriberId, ShutdownError>
    where
        F: FnMut(&InboundMessage) -> Result<(), HandlerError> + Send + 'static,
    {
        let handler: Handler<InboundMessage> = Box::new(handler);
        self.request(|reply| Command::SubscribeMessages { handler, reply })
            .await
    }

    /// Register a handler for connection state changes.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError`] if the client task is gone.
    pub async fn on_connection_state_change<F>(
        &self,
        handler: F,
    ) -> Result<SubscriberId, ShutdownError>
    where
        F: FnMut(&StateChange) -> Result<(), HandlerError> + Send + 'static,
    {
        let handler: Handler<StateChange> = Box::new(handler);
        self.request(|reply| Command::SubscribeState { handler, reply })
            .await
    }

    /// Remove a handler. Returns `false` if it was not registered.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError`] if the client task is gone.
    pub async fn unsubscribe(&self, id: SubscriberId) -> Result<bool, ShutdownError> {
        self.request(|reply| Command::Unsubscribe { id, reply }).await
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every published connection state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Snapshot of the connection statistics.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.stats.borrow().clone()
    }

    /// Number of in-flight and queued messages.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError`] if the client task is gone.
    pub async fn pending(&self) -> Result<PendingCounts, ShutdownError> {
        self.request(|reply| Command::Pending { reply }).await
    }

    /// Disconnect, reject every queued and in-flight message with
    /// [`DeliveryError::Shutdown`], and zero the statistics.
    ///
    /// Returns the statistics as they stood just before they were zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError`] if the client task is gone.
    pub async fn reset(&self) -> Result<ConnectionStats, ShutdownError> {
        self.request(|reply| Command::Reset { reply }).await
    }

    /// Stop the client task. Outstanding messages are rejected with
    /// [`DeliveryError::Shutdown`]. Calling this more than once is harmless.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, ShutdownError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ShutdownError)?;
        rx.await.map_err(|_| ShutdownError)
    }
}

impl std::fmt::Debug for Courier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Courier")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}
