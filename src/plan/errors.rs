//! Wire format error types
//!
//! Error codes:
//! - AGG_WIRE_ENCODE (ERROR)
//! - AGG_WIRE_DECODE (REJECT)

use thiserror::Error;

/// Result type for wire encoding and decoding
pub type WireResult<T> = Result<T, WireError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// A command tree could not be serialized
    #[error("failed to encode commands: {0}")]
    Encode(String),

    /// The payload is not a valid command list
    #[error("failed to decode commands: {0}")]
    Decode(String),
}

impl WireError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            WireError::Encode(_) => "AGG_WIRE_ENCODE",
            WireError::Decode(_) => "AGG_WIRE_DECODE",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            WireError::Encode(m) | WireError::Decode(m) => m,
        }
    }
}
