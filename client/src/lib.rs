//! Confab client library
//!
//! A thin connection layer over the wire protocol: connect, run the key
//! exchange, log in, then exchange envelopes. The binary in this crate
//! builds a terminal chat on top; the server's integration tests drive
//! the same API.

pub mod connection;
pub mod error;

pub use connection::{Connection, ConnectionReader, ConnectionWriter};
pub use error::ClientError;
