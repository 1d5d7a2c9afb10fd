//! Client-side error taxonomy

use confab_protocol::{ErrorCode, ProtocolError};

/// Everything that can go wrong between a client and the server.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Wire-level failure (framing, crypto, codec)
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Socket-level failure
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The server reported an error envelope
    #[error("server error {code}: {message}")]
    Server {
        /// Machine-readable error class
        code: ErrorCode,
        /// Human-readable detail
        message: String,
    },

    /// The server declined the requested username
    #[error("login rejected: {0}")]
    AuthRejected(String),

    /// The server sent something that makes no sense in this state
    #[error("unexpected {0} from server")]
    UnexpectedMessage(&'static str),

    /// The server closed the connection
    #[error("connection closed by server")]
    ConnectionClosed,
}
