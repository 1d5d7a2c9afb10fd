//! Error types for the protocol layer

use thiserror::Error;

/// Errors that can occur while framing, encoding or encrypting envelopes
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Invalid key format or length
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Encryption failure
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Decryption failure (tamper, corruption or wrong key)
    #[error("decryption failed")]
    Decryption,

    /// Envelope serialization/deserialization failure
    #[error("codec error: {0}")]
    Codec(String),

    /// Incoming frame exceeds the configured limit
    #[error("frame of {got} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Advertised frame length
        got: usize,
        /// Configured maximum
        limit: usize,
    },

    /// Underlying stream error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
