//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur while scanning or decoding replies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid type byte: {0:#04x}")]
    InvalidType(u8),

    #[error("invalid length or integer: {0:?}")]
    InvalidInteger(String),

    #[error("bulk string too large: {size} bytes (max {max})")]
    BulkTooLarge { size: i64, max: i64 },

    #[error("array too large: {size} elements (max {max})")]
    ArrayTooLarge { size: i64, max: i64 },

    #[error("missing CRLF terminator at offset {0}")]
    MissingTerminator(usize),

    #[error("incomplete frame at offset {0}")]
    Incomplete(usize),

    #[error("nesting too deep (max {0})")]
    NestingTooDeep(usize),
}

impl ProtocolError {
    /// Returns whether the error only means more bytes are needed.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::Incomplete(_))
    }
}
