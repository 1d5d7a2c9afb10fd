//! Confab Wire Protocol
//!
//! This crate provides the shared protocol layer for Confab: envelope
//! types, length-prefixed framing over a byte stream, and the
//! per-connection cipher session (x25519 handshake + AES-256-GCM).

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod cipher;
pub mod envelope;
pub mod error;
pub mod framing;

pub use cipher::{accept_key_exchange, CipherSession, ClientHandshake, KeyOffer, SESSION_KEY_LEN};
pub use envelope::{timestamp_now, Body, Envelope, ErrorCode};
pub use error::ProtocolError;
pub use framing::{read_frame, write_frame, DEFAULT_MAX_FRAME};

/// Version of the wire protocol
pub const PROTOCOL_VERSION: u8 = 1;
