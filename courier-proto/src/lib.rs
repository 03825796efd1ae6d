//! Shared protocol definitions for the Courier wire format.

pub mod codec;
pub mod frame;
