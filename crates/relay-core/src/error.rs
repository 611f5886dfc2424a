//! Error types for message encoding.

use thiserror::Error;

/// Errors raised while turning a message into its wire-ready form or back.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// The byte stream did not hold a valid message.
    #[error("failed to decode message: {0}")]
    Decode(String),
}

impl CodecError {
    pub(crate) fn encode(e: impl std::fmt::Display) -> Self {
        CodecError::Encode(e.to_string())
    }

    pub(crate) fn decode(e: impl std::fmt::Display) -> Self {
        CodecError::Decode(e.to_string())
    }
}
