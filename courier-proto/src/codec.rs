//! Serialization and deserialization for the Courier wire protocol.
//!
//! Frames are JSON objects (see [`crate::frame`]). Transports are expected to
//! deliver whole frames, so no length-prefix framing is applied here.

use crate::frame::Frame;

/// Default upper bound on an encoded frame (64 KB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame is larger than the permitted size.
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    Oversized {
        /// Actual size in bytes.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Encodes a [`Frame`] into a JSON byte vector.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`Frame`] from JSON bytes.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes are not a valid frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a frame after checking it against a size limit.
///
/// # Errors
///
/// Returns `CodecError::Oversized` before attempting to parse if `bytes`
/// exceeds `max`, otherwise behaves like [`decode`].
pub fn decode_bounded(bytes: &[u8], max: usize) -> Result<Frame, CodecError> {
    if bytes.len() > max {
        return Err(CodecError::Oversized {
            size: bytes.len(),
            max,
        });
    }
    decode(bytes)
}
