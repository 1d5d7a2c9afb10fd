//! Server configuration

use anyhow::{Context, Result};
use std::env;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum simultaneous connections (0 = unlimited)
    pub max_connections: usize,
    /// Maximum wire frame size in bytes
    pub max_frame_size: usize,
    /// Maximum declared file size for a transfer, in bytes
    pub max_file_size: u64,
    /// Maximum file chunk payload in bytes
    pub chunk_size: usize,
    /// Seconds to complete the key exchange before dropping the connection
    pub handshake_timeout_seconds: u64,
    /// Seconds to authenticate after the key exchange before dropping
    pub auth_timeout_seconds: u64,
    /// Protocol violations tolerated before the session is dropped
    pub violation_limit: u32,
    /// Seconds to wait for sessions to drain on shutdown
    pub shutdown_grace_seconds: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = ServerConfig {
            host: env::var("CONFAB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("CONFAB_PORT")
                .unwrap_or_else(|_| "9400".to_string())
                .parse()
                .context("Invalid CONFAB_PORT")?,
            max_connections: env::var("CONFAB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "200".to_string())
                .parse()
                .context("Invalid CONFAB_MAX_CONNECTIONS")?,
            max_frame_size: env::var("CONFAB_MAX_FRAME_SIZE")
                .unwrap_or_else(|_| "1048576".to_string()) // 1MB
                .parse()
                .context("Invalid CONFAB_MAX_FRAME_SIZE")?,
            max_file_size: env::var("CONFAB_MAX_FILE_SIZE")
                .unwrap_or_else(|_| "104857600".to_string()) // 100MB
                .parse()
                .context("Invalid CONFAB_MAX_FILE_SIZE")?,
            chunk_size: env::var("CONFAB_CHUNK_SIZE")
                .unwrap_or_else(|_| "65536".to_string()) // 64KB
                .parse()
                .context("Invalid CONFAB_CHUNK_SIZE")?,
            handshake_timeout_seconds: env::var("CONFAB_HANDSHAKE_TIMEOUT")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid CONFAB_HANDSHAKE_TIMEOUT")?,
            auth_timeout_seconds: env::var("CONFAB_AUTH_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid CONFAB_AUTH_TIMEOUT")?,
            violation_limit: env::var("CONFAB_VIOLATION_LIMIT")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Invalid CONFAB_VIOLATION_LIMIT")?,
            shutdown_grace_seconds: env::var("CONFAB_SHUTDOWN_GRACE")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Invalid CONFAB_SHUTDOWN_GRACE")?,
        };

        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 9400,
            max_connections: 200,
            max_frame_size: 1024 * 1024,
            max_file_size: 100 * 1024 * 1024,
            chunk_size: 64 * 1024,
            handshake_timeout_seconds: 10,
            auth_timeout_seconds: 30,
            violation_limit: 5,
            shutdown_grace_seconds: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 9400);
        assert!(config.max_connections > 0);
        assert!(config.chunk_size <= config.max_frame_size);
        assert!(config.violation_limit > 0);
    }
}
