//! Session-level error taxonomy
//!
//! Every error here is scoped to one session: it is reported back to the
//! offending connection as an ERROR envelope and never terminates the
//! server or affects other sessions.

use confab_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Errors raised while processing one session's traffic.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Username already registered by a live session
    #[error("username '{0}' is already taken")]
    DuplicateUsername(String),

    /// Username fails validation
    #[error("invalid username: {0}")]
    InvalidUsername(&'static str),

    /// Private-message target is not registered
    #[error("user '{0}' is not connected")]
    UnknownRecipient(String),

    /// Caller is not the party allowed to perform this transfer action
    #[error("not authorized for this transfer")]
    Unauthorized,

    /// File-transfer recipient is not connected
    #[error("recipient '{0}' is not connected")]
    RecipientOffline(String),

    /// Envelope payload failed to decrypt
    #[error("payload failed to decrypt")]
    Decryption,

    /// Malformed envelope, bad sequencing, or a message type that is
    /// illegal in the session's current state
    #[error("protocol violation: {0}")]
    Violation(String),

    /// Wire-level failure (codec, framing, i/o)
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// The ERROR envelope code reported to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::DuplicateUsername(_) => ErrorCode::DuplicateUsername,
            SessionError::InvalidUsername(_) => ErrorCode::InvalidUsername,
            SessionError::UnknownRecipient(_) => ErrorCode::UnknownRecipient,
            SessionError::Unauthorized => ErrorCode::Unauthorized,
            SessionError::RecipientOffline(_) => ErrorCode::RecipientOffline,
            SessionError::Decryption => ErrorCode::DecryptionError,
            SessionError::Violation(_) => ErrorCode::ProtocolViolation,
            SessionError::Protocol(_) => ErrorCode::ProtocolViolation,
        }
    }

    /// Whether this error counts toward the forced-disconnect threshold.
    ///
    /// Only violations and decryption failures escalate; business errors
    /// like an unknown recipient are part of normal operation.
    pub fn counts_as_violation(&self) -> bool {
        matches!(
            self,
            SessionError::Violation(_) | SessionError::Decryption | SessionError::Protocol(_)
        )
    }
}
