//! Delivery tracking: outbound messages, their completion futures, and the
//! table of in-flight acknowledgment waiters.
//!
//! [`DeliveryTracker`] is a slot arena. Each waiter lives in a slot addressed
//! by a [`SlotKey`] that carries the slot's generation; when a slot is freed
//! and reused the generation moves on, so an ack timer armed for the old
//! occupant can never touch the new one.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use courier_proto::frame::MessageId;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Lifecycle of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    /// Accepted but not yet written to the transport.
    Pending,
    /// Written to the transport, awaiting acknowledgment.
    Sent,
    /// Acknowledged by the receiver.
    Acknowledged,
    /// Retries exhausted without acknowledgment.
    Failed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// A unit of content to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Caller-assigned identifier, unique for the lifetime of the client.
    pub id: MessageId,
    /// Opaque content plus metadata.
    pub payload: serde_json::Value,
}

impl OutboundMessage {
    /// Create a message with an arbitrary JSON payload.
    pub fn new(id: impl Into<MessageId>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// Create a plain-text message.
    ///
    /// The payload is `{"content_type": "text/plain", "body": <body>}`.
    pub fn text(id: impl Into<MessageId>, body: impl Into<String>) -> Self {
        Self::new(
            id,
            serde_json::json!({
                "content_type": "text/plain",
                "body": body.into(),
            }),
        )
    }

    /// Address the message to a channel by setting `payload.channel`.
    ///
    /// A non-object payload is wrapped as `{"body": <payload>}` first.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        if !self.payload.is_object() {
            let body = std::mem::take(&mut self.payload);
            self.payload = serde_json::json!({ "body": body });
        }
        if let Some(fields) = self.payload.as_object_mut() {
            fields.insert("channel".into(), serde_json::Value::String(channel.into()));
        }
        self
    }
}

/// Successful outcome of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckResult {
    /// The acknowledged message.
    pub id: MessageId,
    /// Time from the last transmission to the acknowledgment.
    pub latency: Duration,
    /// Number of retransmissions before the acknowledgment arrived.
    pub retries: u32,
}

/// Why a delivery future rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// No acknowledgment after the full retry budget; status is FAILED.
    #[error("message {id} not acknowledged after {retries} retries")]
    Exhausted {
        /// The failed message.
        id: MessageId,
        /// Retransmissions performed.
        retries: u32,
    },

    /// Evicted from a full offline queue before it could be sent.
    #[error("message {id} evicted from full offline queue")]
    QueueOverflow {
        /// The evicted message.
        id: MessageId,
    },

    /// A message with this id is already queued or in flight.
    #[error("message {id} is already pending")]
    DuplicateId {
        /// The rejected id.
        id: MessageId,
    },

    /// The message could not be encoded as a frame.
    #[error("message encoding failed: {0}")]
    Encoding(String),

    /// The encoded frame exceeds the frame size limit. Never transmitted.
    #[error("message {id} encodes to {size} bytes, limit is {max}")]
    TooLarge {
        /// The rejected message.
        id: MessageId,
        /// Encoded frame size in bytes.
        size: usize,
        /// Largest frame the protocol accepts.
        max: usize,
    },

    /// The client was reset or shut down before the message completed.
    #[error("client shut down")]
    Shutdown,
}

impl DeliveryError {
    /// Whether resubmitting the same message may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::QueueOverflow { .. })
    }
}

/// Completion channel for one delivery.
pub type DeliveryReply = oneshot::Sender<Result<AckResult, DeliveryError>>;

/// A message owned by the client task, from submission to completion.
#[derive(Debug)]
pub struct Delivery {
    /// The message being delivered.
    pub message: OutboundMessage,
    /// Current status.
    pub status: DeliveryStatus,
    /// Retransmissions so far.
    pub retry_count: u32,
    /// Submission order, used to restore send order after a requeue.
    pub seq: u64,
    reply: DeliveryReply,
}

impl Delivery {
    /// Wrap a freshly submitted message.
    #[must_use]
    pub const fn new(message: OutboundMessage, seq: u64, reply: DeliveryReply) -> Self {
        Self {
            message,
            status: DeliveryStatus::Pending,
            retry_count: 0,
            seq,
            reply,
        }
    }

    /// The message id.
    #[must_use]
    pub const fn id(&self) -> &MessageId {
        &self.message.id
    }

    /// Complete the delivery successfully.
    pub fn resolve(mut self, latency: Duration) {
        self.status = DeliveryStatus::Acknowledged;
        let result = AckResult {
            id: self.message.id,
            latency,
            retries: self.retry_count,
        };
        // The caller may have dropped its receipt.
        let _ = self.reply.send(Ok(result));
    }

    /// Complete the delivery with an error.
    pub fn reject(mut self, error: DeliveryError) {
        self.status = DeliveryStatus::Failed;
        let _ = self.reply.send(Err(error));
    }
}

/// Address of a slot in the [`DeliveryTracker`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: usize,
    generation: u32,
}

impl SlotKey {
    pub(crate) const fn new(index: usize, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// One in-flight acknowledgment expectation.
#[derive(Debug)]
pub struct AckWaiter {
    /// The delivery awaiting acknowledgment.
    pub delivery: Delivery,
    /// When the delivery was last written to the transport.
    pub sent_at: Instant,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    waiter: Option<AckWaiter>,
}

/// Arena of in-flight [`AckWaiter`]s indexed by message id.
///
/// # Invariant
///
/// At most one waiter exists per message id.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_id: HashMap<MessageId, SlotKey>,
}

impl DeliveryTracker {
    /// An empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for the acknowledgment of `delivery`.
    ///
    /// # Errors
    ///
    /// Hands the delivery back if a waiter for its id already exists.
    pub fn insert(&mut self, delivery: Delivery, sent_at: Instant) -> Result<SlotKey, Delivery> {
        if self.by_id.contains_key(delivery.id()) {
            return Err(delivery);
        }
        let index = self.free.pop().unwrap_or_else(|| {
            self.slots.push(Slot::default());
            self.slots.len() - 1
        });
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        let key = SlotKey::new(index, slot.generation);
        self.by_id.insert(delivery.id().clone(), key);
        slot.waiter = Some(AckWaiter { delivery, sent_at });
        Ok(key)
    }

    /// Look up a waiter by slot key.
    pub fn get_mut(&mut self, key: SlotKey) -> Option<&mut AckWaiter> {
        self.slots
            .get_mut(key.index)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.waiter.as_mut())
    }

    /// Remove a waiter by slot key. Stale keys return `None`.
    pub fn remove(&mut self, key: SlotKey) -> Option<AckWaiter> {
        let slot = self
            .slots
            .get_mut(key.index)
            .filter(|slot| slot.generation == key.generation)?;
        let waiter = slot.waiter.take()?;
        self.by_id.remove(waiter.delivery.id());
        self.free.push(key.index);
        Some(waiter)
    }

    /// Remove the waiter for an acknowledged message id.
    ///
    /// Returns `None` for unknown ids (late or duplicate acks).
    pub fn acknowledge(&mut self, id: &MessageId) -> Option<(SlotKey, AckWaiter)> {
        let key = *self.by_id.get(id)?;
        self.remove(key).map(|waiter| (key, waiter))
    }

    /// Whether a waiter exists for `id`.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Number of in-flight waiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Remove every waiter, returning them with their slot keys in original
    /// send order.
    pub fn drain_in_send_order(&mut self) -> Vec<(SlotKey, AckWaiter)> {
        let keys: Vec<SlotKey> = self.by_id.values().copied().collect();
        let mut drained: Vec<_> = keys
            .into_iter()
            .filter_map(|key| self.remove(key).map(|waiter| (key, waiter)))
            .collect();
        drained.sort_by_key(|(_, waiter)| waiter.delivery.seq);
        drained
    }
}
