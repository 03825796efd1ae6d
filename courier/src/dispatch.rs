//! Fan-out of inbound messages and connection-state changes to subscribers.
//!
//! Handlers run synchronously on the client task, in registration order. A
//! handler that returns an error or panics does not stop the handlers after
//! it; the failure is reported on the dispatcher's error channel instead.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use courier_proto::frame::{MessageId, Timestamp};
use tokio::sync::mpsc;

use crate::connection::{ConnectionError, ConnectionState};

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked for every event of type `E`.
pub type Handler<E> = Box<dyn FnMut(&E) -> Result<(), HandlerError> + Send>;

/// Identifies one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

/// An application message received from the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Sender-assigned id.
    pub id: MessageId,
    /// Opaque content.
    pub payload: serde_json::Value,
    /// Sender-side timestamp.
    pub timestamp: Timestamp,
}

/// A connection state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// State before the transition.
    pub previous: ConnectionState,
    /// State after the transition.
    pub current: ConnectionState,
    /// Cause, for transitions triggered by a failure.
    pub error: Option<ConnectionError>,
}

/// A subscriber failure reported on the error channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The handler returned an error.
    #[error("{subscriber} failed: {reason}")]
    Failed {
        /// The failing handler.
        subscriber: SubscriberId,
        /// The returned error, rendered.
        reason: String,
    },

    /// The handler panicked.
    #[error("{subscriber} panicked: {reason}")]
    Panicked {
        /// The failing handler.
        subscriber: SubscriberId,
        /// The panic message, if it was a string.
        reason: String,
    },
}

/// Registry of message and state-change handlers.
pub struct EventDispatcher {
    message_handlers: Vec<(SubscriberId, Handler<InboundMessage>)>,
    state_handlers: Vec<(SubscriberId, Handler<StateChange>)>,
    next_id: u64,
    errors: mpsc::UnboundedSender<DispatchError>,
}

impl EventDispatcher {
    /// An empty dispatcher and the receiving end of its error channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DispatchError>) {
        let (errors, errors_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            message_handlers: Vec::new(),
            state_handlers: Vec::new(),
            next_id: 0,
            errors,
        };
        (dispatcher, errors_rx)
    }

    /// Register a handler for inbound messages.
    pub fn subscribe_messages<F>(&mut self, handler: F) -> SubscriberId
    where
        F: FnMut(&InboundMessage) -> Result<(), HandlerError> + Send + 'static,
    {
        let id = self.allocate();
        self.message_handlers.push((id, Box::new(handler)));
        id
    }

    /// Register a handler for connection state changes.
    pub fn subscribe_state<F>(&mut self, handler: F) -> SubscriberId
    where
        F: FnMut(&StateChange) -> Result<(), HandlerError> + Send + 'static,
    {
        let id = self.allocate();
        self.state_handlers.push((id, Box::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if the id is unknown.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.message_handlers.len() + self.state_handlers.len();
        self.message_handlers.retain(|(sid, _)| *sid != id);
        self.state_handlers.retain(|(sid, _)| *sid != id);
        before != self.message_handlers.len() + self.state_handlers.len()
    }

    /// Number of registered handlers of both kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.message_handlers.len() + self.state_handlers.len()
    }

    /// Whether no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an inbound message to every message handler.
    pub fn dispatch_message(&mut self, message: &InboundMessage) {
        invoke_all(&mut self.message_handlers, message, &self.errors);
    }

    /// Deliver a state change to every state handler.
    pub fn dispatch_state(&mut self, change: &StateChange) {
        invoke_all(&mut self.state_handlers, change, &self.errors);
    }

    const fn allocate(&mut self) -> SubscriberId {
        self.next_id += 1;
        SubscriberId(self.next_id)
    }
}

fn invoke_all<E>(
    handlers: &mut [(SubscriberId, Handler<E>)],
    event: &E,
    errors: &mpsc::UnboundedSender<DispatchError>,
) {
    for (subscriber, handler) in handlers.iter_mut() {
        let failure = match catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => DispatchError::Failed {
                subscriber: *subscriber,
                reason: e.to_string(),
            },
            Err(panic) => DispatchError::Panicked {
                subscriber: *subscriber,
                reason: panic_message(panic.as_ref()),
            },
        };
        tracing::warn!(%subscriber, error = %failure, "event handler failed");
        // Nobody listening on the error channel is not a reason to stop.
        let _ = errors.send(failure);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
