//! `Courier` — at-least-once real-time message delivery over a persistent
//! bidirectional connection.
//!
//! The [`Courier`] handle talks to a single background task that owns the
//! connection state machine, the acknowledgment tracker, the offline queue,
//! the heartbeat monitor, and every timer. See [`client`] for the public
//! operations.

pub mod client;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod dispatch;
pub mod heartbeat;
pub mod queue;
pub mod stats;
pub mod timers;
pub mod transport;

pub use client::{ConnectError, Courier, DeliveryReceipt, PendingCounts, ShutdownError};
pub use config::{ConfigError, CourierConfig};
pub use connection::{ConnectionError, ConnectionState};
pub use courier_proto::frame::MessageId;
pub use delivery::{AckResult, DeliveryError, DeliveryStatus, OutboundMessage};
pub use dispatch::{DispatchError, HandlerError, InboundMessage, StateChange, SubscriberId};
pub use stats::ConnectionStats;
