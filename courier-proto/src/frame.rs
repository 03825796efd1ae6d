//! Wire format frame types for the Courier protocol.
//!
//! Every unit on the wire is a [`Frame`], serialized as a JSON object with a
//! `type` discriminator:
//!
//! ```json
//! { "type": "message", "id": "m1", "payload": {"body": "hi"}, "timestamp": 1700000000000 }
//! { "type": "ack",     "id": "m1", "timestamp": 1700000000042 }
//! { "type": "ping",    "id": "hb-3", "timestamp": 1700000000100 }
//! { "type": "pong",    "id": "hb-3" }
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-assigned message identifier, used as the acknowledgment
/// correlation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps an existing identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh time-ordered identifier (UUID v7).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A single protocol frame.
///
/// `payload` is opaque to the protocol; it defaults to `null` when absent.
/// `timestamp` defaults to zero so that minimal peers may omit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Application message that the receiver must acknowledge.
    Message {
        /// Correlation id, echoed back in the matching ack.
        id: MessageId,
        /// Opaque application content.
        #[serde(default)]
        payload: serde_json::Value,
        /// Sender-side creation time.
        #[serde(default)]
        timestamp: Timestamp,
    },
    /// Receiver confirmation for the message with the same id.
    Ack {
        /// Id of the acknowledged message.
        id: MessageId,
        /// Receiver-side acknowledgment time.
        #[serde(default)]
        timestamp: Timestamp,
    },
    /// Liveness probe.
    Ping {
        /// Probe id, echoed back in the matching pong.
        id: MessageId,
        /// Probe send time.
        #[serde(default)]
        timestamp: Timestamp,
    },
    /// Liveness probe reply.
    Pong {
        /// Id of the probe being answered.
        id: MessageId,
        /// Reply time.
        #[serde(default)]
        timestamp: Timestamp,
    },
}

/// Discriminant of a [`Frame`], handy for logging and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// `message`
    Message,
    /// `ack`
    Ack,
    /// `ping`
    Ping,
    /// `pong`
    Pong,
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Message => "message",
            Self::Ack => "ack",
            Self::Ping => "ping",
            Self::Pong => "pong",
        };
        f.write_str(name)
    }
}

impl Frame {
    /// Builds a `message` frame stamped with the current time.
    #[must_use]
    pub fn message(id: MessageId, payload: serde_json::Value) -> Self {
        Self::Message {
            id,
            payload,
            timestamp: Timestamp::now(),
        }
    }

    /// Builds an `ack` frame for the given message id.
    #[must_use]
    pub fn ack(id: MessageId) -> Self {
        Self::Ack {
            id,
            timestamp: Timestamp::now(),
        }
    }

    /// Builds a `ping` frame.
    #[must_use]
    pub fn ping(id: MessageId) -> Self {
        Self::Ping {
            id,
            timestamp: Timestamp::now(),
        }
    }

    /// Builds a `pong` frame answering the probe with the given id.
    #[must_use]
    pub fn pong(id: MessageId) -> Self {
        Self::Pong {
            id,
            timestamp: Timestamp::now(),
        }
    }

    /// Returns the correlation id carried by any frame type.
    #[must_use]
    pub const fn id(&self) -> &MessageId {
        match self {
            Self::Message { id, .. }
            | Self::Ack { id, .. }
            | Self::Ping { id, .. }
            | Self::Pong { id, .. } => id,
        }
    }

    /// Returns the frame's timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> Timestamp {
        match self {
            Self::Message { timestamp, .. }
            | Self::Ack { timestamp, .. }
            | Self::Ping { timestamp, .. }
            | Self::Pong { timestamp, .. } => *timestamp,
        }
    }

    /// Returns the frame discriminant.
    #[must_use]
    pub const fn kind(&self) -> FrameKind {
        match self {
            Self::Message { .. } => FrameKind::Message,
            Self::Ack { .. } => FrameKind::Ack,
            Self::Ping { .. } => FrameKind::Ping,
            Self::Pong { .. } => FrameKind::Pong,
        }
    }
}
