//! Shared helpers for end-to-end tests: a real server on an ephemeral
//! port, driven through the client crate's connection layer.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::watch;

use confab_client::Connection;
use confab_protocol::Envelope;
use confab_server::{Server, ServerConfig};

/// How long to wait for a message we expect to arrive.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to listen when asserting that nothing arrives.
pub const QUIET_WINDOW: Duration = Duration::from_millis(300);

/// Config suitable for tests: loopback, ephemeral port, small limits.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        max_file_size: 1024 * 1024,
        chunk_size: 1024,
        shutdown_grace_seconds: 1,
        ..ServerConfig::default()
    }
}

/// Start a server and return its address plus the shutdown trigger.
pub async fn start_server(config: ServerConfig) -> (SocketAddr, watch::Sender<bool>) {
    let server = Server::bind(config).await.expect("bind test server");
    let addr = server.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = server.run(shutdown_rx).await;
    });
    (addr, shutdown_tx)
}

/// Connect and log in as `username`.
pub async fn join(addr: SocketAddr, username: &str) -> Connection {
    let mut conn = Connection::connect(addr).await.expect("connect");
    conn.login(username).await.expect("login");
    conn
}

/// Receive envelopes until one matches `want` (a wire type tag like
/// "PUBLIC_MESSAGE"), skipping room chatter such as join notices.
pub async fn recv_expect(conn: &mut Connection, want: &str) -> Envelope {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let env = tokio::time::timeout_at(deadline, conn.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", want))
            .expect("recv");
        if env.body.type_name() == want {
            return env;
        }
    }
}

/// Collect everything that arrives within the quiet window.
pub async fn drain(conn: &mut Connection) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(Ok(env)) = tokio::time::timeout(QUIET_WINDOW, conn.recv()).await {
        out.push(env);
    }
    out
}
