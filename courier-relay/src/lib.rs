//! `Courier` relay server library.
//!
//! Exposes the relay server for use in tests and embedding. The relay
//! accepts WebSocket connections, acknowledges every `message` frame,
//! answers heartbeats, and forwards messages to the other connected clients.

pub mod config;
pub mod relay;
