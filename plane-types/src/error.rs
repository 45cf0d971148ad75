//! Error types for the shareplane wire format.

use thiserror::Error;

/// Errors that can occur while encoding or decoding records.
#[derive(Debug, Error)]
pub enum WireError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Frame body was empty (no tag byte)
    #[error("empty frame")]
    EmptyFrame,

    /// Unknown body tag
    #[error("unknown frame tag: {0:#04x}")]
    UnknownTag(u8),

    /// Invalid action discriminator in a compact update
    #[error("invalid action: {0}")]
    InvalidAction(u8),

    /// Compact body shorter than its declared layout
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required by the layout.
        expected: usize,
        /// Bytes actually present.
        actual: usize,
    },

    /// Compact body longer than its declared layout
    #[error("{0} trailing bytes after compact update")]
    TrailingBytes(usize),

    /// Object id is not valid UTF-8
    #[error("object id is not valid utf-8")]
    InvalidUtf8,

    /// Object id does not fit the compact length field
    #[error("object id too long: {0} bytes")]
    IdTooLong(usize),

    /// Encoded record exceeds the frame limit
    #[error("frame too large: {size} bytes (limit: {limit} bytes)")]
    FrameTooLarge {
        /// Encoded size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },
}
