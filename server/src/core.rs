//! Listener and session supervision
//!
//! The server accepts TCP connections, caps concurrency with a semaphore,
//! and spawns one handler task per accepted socket into a JoinSet. On
//! shutdown the accept loop stops, the watch channel tells every handler
//! to drain, and sessions still alive after the grace period are aborted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use confab_protocol::{write_frame, Envelope, ErrorCode};

use crate::config::ServerConfig;
use crate::connection::{handle_connection, ServerState};

/// A bound, not-yet-running chat server.
pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    /// Bind the listener described by the config. Fails fast on an
    /// unavailable address so startup errors surface before any client
    /// can connect.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        info!(addr = %listener.local_addr()?, "listening");
        Ok(Server {
            listener,
            state: Arc::new(ServerState::new(config)),
        })
    }

    /// The bound address, useful when the config asked for port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("listener address")
    }

    /// Accept connections until the shutdown signal flips, then drain.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let max = self.state.config.max_connections;
        let permits = if max == 0 { Semaphore::MAX_PERMITS } else { max };
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    match Arc::clone(&semaphore).try_acquire_owned() {
                        Ok(permit) => {
                            let state = Arc::clone(&self.state);
                            let shutdown_rx = shutdown.clone();
                            sessions.spawn(async move {
                                handle_connection(state, stream, addr, shutdown_rx).await;
                                drop(permit);
                            });
                        }
                        Err(_) => {
                            warn!(%addr, "connection refused: at capacity");
                            tokio::spawn(refuse(stream));
                        }
                    }

                    // Reap finished handlers so the set stays small.
                    while sessions.try_join_next().is_some() {}
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(live = sessions.len(), "listener stopped, draining sessions");
        let grace = Duration::from_secs(self.state.config.shutdown_grace_seconds);
        let drained = tokio::time::timeout(grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = sessions.len(), "grace period elapsed, aborting sessions");
            sessions.shutdown().await;
        }
        debug!("server stopped");
        Ok(())
    }
}

/// Tell an over-capacity client why it is being turned away. Sent as a
/// plaintext frame since no key exchange has happened.
async fn refuse(mut stream: TcpStream) {
    let reply = Envelope::error(ErrorCode::ResourceExhausted, "server is at capacity");
    if let Ok(bytes) = reply.to_bytes() {
        let _ = write_frame(&mut stream, &bytes).await;
    }
}
