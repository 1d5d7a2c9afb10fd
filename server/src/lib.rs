//! Confab chat server
//!
//! Accepts TCP connections, negotiates a per-session cipher, and relays
//! chat messages and file transfers between authenticated users. Nothing
//! is persisted; a user exists exactly as long as their connection.

pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod registry;
pub mod router;
pub mod transfer;

pub use config::ServerConfig;
pub use self::core::Server;
