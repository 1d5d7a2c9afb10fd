//! Envelope types exchanged between client and server
//!
//! An envelope is one discrete protocol message: a type tag, the
//! type-specific body, and routing metadata (sender, timestamp). Envelopes
//! are immutable once constructed and serialize to JSON on the wire; the
//! framing layer owns the byte-level encoding.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProtocolError, Result};

/// One protocol message unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Unique message id
    pub id: Uuid,
    /// Authenticated sender username; `None` before authentication and for
    /// server-originated envelopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Client-set timestamp, milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Type tag and type-specific payload
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    /// Create an envelope with a fresh id and no sender/timestamp.
    pub fn new(body: Body) -> Self {
        Envelope {
            id: Uuid::new_v4(),
            sender: None,
            timestamp: None,
            body,
        }
    }

    /// Create an envelope stamped with the current wall-clock time.
    pub fn stamped(body: Body) -> Self {
        Envelope {
            id: Uuid::new_v4(),
            sender: None,
            timestamp: Some(timestamp_now()),
            body,
        }
    }

    /// Attach a sender username.
    pub fn from_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Build an ERROR envelope.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Envelope::new(Body::Error {
            code,
            message: message.into(),
        })
    }

    /// Serialize to wire bytes (JSON).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Codec(e.to_string()))
    }

    /// Deserialize from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Codec(e.to_string()))
    }
}

/// Envelope body, tagged by message type on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Body {
    /// Client public key, opening the handshake (plaintext phase)
    KeyExchange {
        /// Client x25519 public key
        #[serde(with = "b64")]
        public_key: Vec<u8>,
    },
    /// Server reply to KEY_EXCHANGE: ephemeral public key plus the fresh
    /// session key wrapped under the DH-derived key (plaintext phase)
    SessionKey {
        /// Server ephemeral x25519 public key
        #[serde(with = "b64")]
        public_key: Vec<u8>,
        /// `nonce || AES-256-GCM(session key)`
        #[serde(with = "b64")]
        wrapped_key: Vec<u8>,
    },
    /// Username registration attempt
    AuthRequest {
        /// Requested username
        username: String,
    },
    /// Registration outcome
    AuthResponse {
        /// Whether the username was accepted
        accepted: bool,
        /// Rejection reason ("duplicate", "empty", ...)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Current user list snapshot on acceptance
        #[serde(default)]
        users: Vec<String>,
    },
    /// Chat message to every active session
    PublicMessage {
        /// Message text
        content: String,
    },
    /// Chat message to one named recipient
    PrivateMessage {
        /// Target username
        recipient: String,
        /// Message text
        content: String,
    },
    /// Ask for the current user list
    UserListRequest,
    /// User list snapshot, in registration order
    UserListResponse {
        /// Usernames, oldest registration first
        users: Vec<String>,
    },
    /// A user registered
    UserJoined {
        /// The new user
        username: String,
    },
    /// A user disconnected
    UserLeft {
        /// The departed user
        username: String,
    },
    /// Server-originated informational notice
    SystemMessage {
        /// Notice text
        content: String,
    },
    /// Offer a file to a named recipient
    FileTransferRequest {
        /// Sender-generated transfer id
        transfer_id: Uuid,
        /// Target username
        recipient: String,
        /// File name (no path)
        file_name: String,
        /// Total byte count
        total_size: u64,
    },
    /// Recipient's accept/decline decision
    FileTransferResponse {
        /// Transfer being answered
        transfer_id: Uuid,
        /// Whether the recipient accepted
        accepted: bool,
    },
    /// One file chunk, in sequence order
    FileChunk {
        /// Transfer the chunk belongs to
        transfer_id: Uuid,
        /// Zero-based chunk sequence number
        sequence: u64,
        /// Chunk payload
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    /// Sender signals all chunks delivered
    FileTransferComplete {
        /// Finished transfer
        transfer_id: Uuid,
    },
    /// A transfer was forcibly cancelled (peer disconnected)
    FileTransferCancelled {
        /// Cancelled transfer
        transfer_id: Uuid,
        /// Human-readable cause
        reason: String,
    },
    /// Orderly goodbye
    Disconnect,
    /// Error report, delivered to the offending session only
    Error {
        /// Machine-readable error class
        code: ErrorCode,
        /// Human-readable detail
        message: String,
    },
}

impl Body {
    /// Wire name of the type tag, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Body::KeyExchange { .. } => "KEY_EXCHANGE",
            Body::SessionKey { .. } => "SESSION_KEY",
            Body::AuthRequest { .. } => "AUTH_REQUEST",
            Body::AuthResponse { .. } => "AUTH_RESPONSE",
            Body::PublicMessage { .. } => "PUBLIC_MESSAGE",
            Body::PrivateMessage { .. } => "PRIVATE_MESSAGE",
            Body::UserListRequest => "USER_LIST_REQUEST",
            Body::UserListResponse { .. } => "USER_LIST_RESPONSE",
            Body::UserJoined { .. } => "USER_JOINED",
            Body::UserLeft { .. } => "USER_LEFT",
            Body::SystemMessage { .. } => "SYSTEM_MESSAGE",
            Body::FileTransferRequest { .. } => "FILE_TRANSFER_REQUEST",
            Body::FileTransferResponse { .. } => "FILE_TRANSFER_RESPONSE",
            Body::FileChunk { .. } => "FILE_CHUNK",
            Body::FileTransferComplete { .. } => "FILE_TRANSFER_COMPLETE",
            Body::FileTransferCancelled { .. } => "FILE_TRANSFER_CANCELLED",
            Body::Disconnect => "DISCONNECT",
            Body::Error { .. } => "ERROR",
        }
    }
}

/// Machine-readable error classes carried by ERROR envelopes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Key exchange failed (malformed key, unexpected message)
    HandshakeError,
    /// Handshake or authentication deadline expired
    AuthTimeout,
    /// Requested username is already registered
    DuplicateUsername,
    /// Requested username fails validation
    InvalidUsername,
    /// Private-message target is not registered
    UnknownRecipient,
    /// Caller is not a party to the transfer it tried to act on
    Unauthorized,
    /// File-transfer recipient is not connected
    RecipientOffline,
    /// Payload failed to decrypt (tamper or corruption)
    DecryptionError,
    /// Malformed envelope or message illegal in the current state
    ProtocolViolation,
    /// Connection limit reached
    ResourceExhausted,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::HandshakeError => "HANDSHAKE_ERROR",
            ErrorCode::AuthTimeout => "AUTH_TIMEOUT",
            ErrorCode::DuplicateUsername => "DUPLICATE_USERNAME",
            ErrorCode::InvalidUsername => "INVALID_USERNAME",
            ErrorCode::UnknownRecipient => "UNKNOWN_RECIPIENT",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::RecipientOffline => "RECIPIENT_OFFLINE",
            ErrorCode::DecryptionError => "DECRYPTION_ERROR",
            ErrorCode::ProtocolViolation => "PROTOCOL_VIOLATION",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
        };
        f.write_str(name)
    }
}

/// Milliseconds since the Unix epoch.
pub fn timestamp_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Base64 (standard alphabet) serde adapter for binary fields, keeping the
/// JSON wire format compact and printable.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_message_round_trip() {
        let env = Envelope::stamped(Body::PublicMessage {
            content: "hello room".into(),
        })
        .from_sender("alice");

        let bytes = env.to_bytes().unwrap();
        let back = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn wire_tags_are_screaming_snake() {
        let env = Envelope::new(Body::UserListRequest);
        let json: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "USER_LIST_REQUEST");

        let env = Envelope::new(Body::FileTransferRequest {
            transfer_id: Uuid::new_v4(),
            recipient: "bob".into(),
            file_name: "report.pdf".into(),
            total_size: 1000,
        });
        let json: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "FILE_TRANSFER_REQUEST");
        assert_eq!(json["total_size"], 1000);
    }

    #[test]
    fn chunk_data_is_base64_on_the_wire() {
        let env = Envelope::new(Body::FileChunk {
            transfer_id: Uuid::new_v4(),
            sequence: 3,
            data: vec![0xde, 0xad, 0xbe, 0xef],
        });
        let json: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(json["data"], "3q2+7w==");

        let back = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn error_codes_serialize_by_name() {
        let env = Envelope::error(ErrorCode::UnknownRecipient, "no such user");
        let json: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "ERROR");
        assert_eq!(json["code"], "UNKNOWN_RECIPIENT");
    }

    #[test]
    fn malformed_bytes_are_codec_errors() {
        let err = Envelope::from_bytes(b"{not json").unwrap_err();
        assert!(matches!(err, crate::ProtocolError::Codec(_)));

        // Valid JSON, unknown type tag
        let err = Envelope::from_bytes(br#"{"id":"not-a-uuid","type":"NOPE"}"#).unwrap_err();
        assert!(matches!(err, crate::ProtocolError::Codec(_)));
    }
}
