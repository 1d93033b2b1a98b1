//! Protocol-level errors.

use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while framing or decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Socket I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload did not decode as the expected message.
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Frame length exceeded [`crate::framing::MAX_FRAME_LEN`].
    #[error("frame of {len} bytes exceeds the protocol limit")]
    Oversized { len: u64 },

    /// Malformed framing bytes.
    #[error("framing error: {0}")]
    Framing(String),
}
