//! Error types for the envelope codec

use thiserror::Error;

/// Codec error types.
///
/// Every variant is fatal for one envelope only; the stream stays usable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unknown I/O policy ordinal: {0}")]
    UnknownPolicy(u8),

    #[error("Unknown topic ordinal: {0}")]
    UnknownTopic(u8),

    #[error("Unknown message kind: {0}")]
    UnknownMessageKind(u8),

    #[error("Invalid ordering sequence: {0}")]
    InvalidSequence(i64),

    #[error("Frame field too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Failed to encode message body: {0}")]
    Encode(String),

    #[error("Failed to decode message body: {0}")]
    Decode(String),
}

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;
