//! Per-connection session lifecycle
//!
//! Each accepted socket gets one handler task driving a fixed progression:
//! key exchange, authentication, active message loop, cleanup. A writer
//! task owns the socket's write half and drains the session's bounded
//! outbound queue, encrypting each envelope as it goes out; everything
//! after the key exchange travels encrypted. The handler reads frames
//! sequentially, so envelopes from one sender are routed in arrival order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use confab_protocol::{
    accept_key_exchange, read_frame, write_frame, Body, CipherSession, Envelope, ErrorCode,
    ProtocolError,
};

use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::registry::{Registry, SessionHandle};
use crate::router::Router;
use crate::transfer::Coordinator;

/// Outbound queue depth per session. A slow reader fills its queue and
/// backpressures whoever is sending to it.
const OUTBOUND_QUEUE: usize = 50;

/// How long cleanup waits for the writer task to flush queued envelopes.
const FLUSH_GRACE: Duration = Duration::from_secs(5);

/// State shared by every connection handler.
pub struct ServerState {
    pub config: ServerConfig,
    pub registry: Arc<Registry>,
    pub transfers: Arc<Coordinator>,
    pub router: Router,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let transfers = Arc::new(Coordinator::new(
            config.max_file_size,
            config.chunk_size,
        ));
        let router = Router::new(Arc::clone(&registry), Arc::clone(&transfers));
        ServerState {
            config,
            registry,
            transfers,
            router,
        }
    }
}

/// Drive one connection from accept to teardown. Never panics back into
/// the accept loop; all failures end in a logged disconnect.
pub async fn handle_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) {
    debug!(%addr, "connection opened");
    let (mut reader, mut writer) = stream.into_split();

    // Phase 1: key exchange, in plaintext frames.
    let cipher = match handshake(&mut reader, &mut writer, &state.config).await {
        Ok(cipher) => cipher,
        Err(e) => {
            warn!(%addr, error = %e, "handshake failed");
            let code = if e.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
                ErrorCode::AuthTimeout
            } else {
                ErrorCode::HandshakeError
            };
            let reply = Envelope::error(code, "key exchange failed");
            if let Ok(bytes) = reply.to_bytes() {
                let _ = write_frame(&mut writer, &bytes).await;
            }
            return;
        }
    };

    // Writer task: owns the write half, encrypts and frames everything the
    // session is sent. Dropping every Sender clone ends it.
    let (tx, rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE);
    let mut writer_task = tokio::spawn(write_loop(writer, rx, cipher.clone()));

    // Phase 2: authentication, under its own deadline. Rejected attempts
    // keep the connection open for another try.
    let session = match authenticate(&state, &mut reader, &cipher, &tx, addr).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            drop(tx);
            let _ = tokio::time::timeout(FLUSH_GRACE, &mut writer_task).await;
            return;
        }
        Err(e) => {
            debug!(%addr, error = %e, "connection lost before authentication");
            drop(tx);
            writer_task.abort();
            return;
        }
    };

    info!(%addr, user = %session.username, "user joined");
    state
        .router
        .broadcast(
            Envelope::stamped(Body::UserJoined {
                username: session.username.clone(),
            }),
            Some(session.id),
        )
        .await;

    // Phase 3: active message loop.
    let reason = active_loop(&state, &mut reader, &cipher, &session, shutdown).await;
    debug!(%addr, user = %session.username, %reason, "session ended");

    // Phase 4: cleanup. Unregister first so no new traffic targets this
    // session, then cancel its transfers and tell the room.
    teardown(&state, &session).await;

    drop(tx);
    if tokio::time::timeout(FLUSH_GRACE, &mut writer_task).await.is_err() {
        writer_task.abort();
    }
    info!(%addr, user = %session.username, "user disconnected");
}

/// Why the active loop ended, for the disconnect log line.
#[derive(Debug)]
enum EndReason {
    ClientQuit,
    ConnectionLost,
    ViolationLimit,
    Shutdown,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EndReason::ClientQuit => "client quit",
            EndReason::ConnectionLost => "connection lost",
            EndReason::ViolationLimit => "violation limit reached",
            EndReason::Shutdown => "server shutdown",
        };
        f.write_str(s)
    }
}

/// Perform the key exchange: expect KEY_EXCHANGE, answer with SESSION_KEY.
async fn handshake(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    config: &ServerConfig,
) -> Result<CipherSession> {
    let deadline = Instant::now() + Duration::from_secs(config.handshake_timeout_seconds);

    let frame = timeout_at(deadline, read_frame(reader, config.max_frame_size))
        .await
        .context("handshake deadline expired")??
        .ok_or_else(|| anyhow!("peer closed before key exchange"))?;

    let envelope = Envelope::from_bytes(&frame)?;
    let client_public = match envelope.body {
        Body::KeyExchange { public_key } => public_key,
        other => {
            return Err(anyhow!("expected KEY_EXCHANGE, got {}", other.type_name()));
        }
    };

    let (cipher, offer) = accept_key_exchange(&client_public)?;
    let reply = Envelope::new(Body::SessionKey {
        public_key: offer.public_key,
        wrapped_key: offer.wrapped_key,
    });
    write_frame(writer, &reply.to_bytes()?).await?;
    Ok(cipher)
}

/// Read AUTH_REQUEST envelopes until one is accepted or the deadline hits.
///
/// Returns `Ok(None)` when the connection should close without a session
/// (timeout, orderly disconnect). The queued AUTH_RESPONSE / ERROR
/// envelopes are flushed by the writer task before it exits.
async fn authenticate(
    state: &ServerState,
    reader: &mut OwnedReadHalf,
    cipher: &CipherSession,
    tx: &mpsc::Sender<Envelope>,
    addr: SocketAddr,
) -> Result<Option<SessionHandle>> {
    let deadline = Instant::now() + Duration::from_secs(state.config.auth_timeout_seconds);

    loop {
        let frame = match timeout_at(deadline, read_frame(reader, state.config.max_frame_size))
            .await
        {
            Ok(result) => match result? {
                Some(frame) => frame,
                None => return Ok(None),
            },
            Err(_) => {
                warn!(%addr, "authentication deadline expired");
                let _ = tx
                    .send(Envelope::error(
                        ErrorCode::AuthTimeout,
                        "authentication deadline expired",
                    ))
                    .await;
                return Ok(None);
            }
        };

        let envelope = match decode(cipher, &frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                let _ = tx.send(Envelope::error(e.code(), e.to_string())).await;
                continue;
            }
        };

        let username = match envelope.body {
            Body::AuthRequest { username } => username,
            Body::Disconnect => return Ok(None),
            other => {
                let _ = tx
                    .send(Envelope::error(
                        ErrorCode::ProtocolViolation,
                        format!("expected AUTH_REQUEST, got {}", other.type_name()),
                    ))
                    .await;
                continue;
            }
        };

        let handle = SessionHandle {
            id: Uuid::new_v4(),
            username: username.trim().to_string(),
            tx: tx.clone(),
        };

        match state.registry.register(handle.clone()) {
            Ok(()) => {
                let users = state.registry.users();
                tx.send(Envelope::new(Body::AuthResponse {
                    accepted: true,
                    reason: None,
                    users,
                }))
                .await
                .context("writer task gone")?;
                return Ok(Some(handle));
            }
            Err(e) => {
                debug!(%addr, user = %username, error = %e, "registration rejected");
                tx.send(Envelope::new(Body::AuthResponse {
                    accepted: false,
                    reason: Some(e.to_string()),
                    users: Vec::new(),
                }))
                .await
                .context("writer task gone")?;
                // Stay in the loop; the client may retry with another name.
            }
        }
    }
}

/// Main receive loop for an authenticated session.
async fn active_loop(
    state: &ServerState,
    reader: &mut OwnedReadHalf,
    cipher: &CipherSession,
    session: &SessionHandle,
    mut shutdown: watch::Receiver<bool>,
) -> EndReason {
    let mut violations: u32 = 0;

    loop {
        let frame = tokio::select! {
            result = read_frame(reader, state.config.max_frame_size) => match result {
                Ok(Some(frame)) => frame,
                Ok(None) => return EndReason::ConnectionLost,
                Err(ProtocolError::FrameTooLarge { got, limit }) => {
                    let err = SessionError::Violation(format!(
                        "frame of {} bytes exceeds the {} byte limit", got, limit
                    ));
                    if report(session, &err, &mut violations, state.config.violation_limit).await {
                        return EndReason::ViolationLimit;
                    }
                    // The oversized frame was never read off the socket;
                    // nothing sane follows it.
                    return EndReason::ConnectionLost;
                }
                Err(_) => return EndReason::ConnectionLost,
            },
            changed = shutdown.changed() => {
                // A dropped sender means the server is going away too.
                if changed.is_err() || *shutdown.borrow() {
                    let _ = session.tx.send(Envelope::stamped(Body::SystemMessage {
                        content: "server is shutting down".into(),
                    })).await;
                    return EndReason::Shutdown;
                }
                continue;
            }
        };

        let envelope = match decode(cipher, &frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                if report(session, &e, &mut violations, state.config.violation_limit).await {
                    return EndReason::ViolationLimit;
                }
                continue;
            }
        };

        if matches!(envelope.body, Body::Disconnect) {
            return EndReason::ClientQuit;
        }

        if let Err(e) = state.router.route(session, envelope).await {
            if report(session, &e, &mut violations, state.config.violation_limit).await {
                return EndReason::ViolationLimit;
            }
        }
    }
}

/// Decrypt and parse one inbound frame.
fn decode(cipher: &CipherSession, frame: &[u8]) -> std::result::Result<Envelope, SessionError> {
    let plaintext = cipher.decrypt(frame).map_err(|_| SessionError::Decryption)?;
    Envelope::from_bytes(&plaintext).map_err(SessionError::Protocol)
}

/// Send the error back to the offender and track the violation count.
/// Returns true once the session has used up its allowance.
async fn report(
    session: &SessionHandle,
    error: &SessionError,
    violations: &mut u32,
    limit: u32,
) -> bool {
    let _ = session
        .tx
        .send(Envelope::error(error.code(), error.to_string()))
        .await;

    if !error.counts_as_violation() {
        return false;
    }
    *violations += 1;
    if *violations >= limit {
        warn!(user = %session.username, count = violations, "violation limit reached");
        let _ = session
            .tx
            .send(Envelope::error(
                ErrorCode::ProtocolViolation,
                "too many protocol violations",
            ))
            .await;
        true
    } else {
        false
    }
}

/// Remove the session from shared state and notify the survivors.
async fn teardown(state: &ServerState, session: &SessionHandle) {
    if state.registry.unregister(session.id).is_none() {
        return;
    }

    for (tx, notice) in state.transfers.cancel_for(session.id, &session.username) {
        let _ = tx.send(notice).await;
    }

    state
        .router
        .broadcast(
            Envelope::stamped(Body::UserLeft {
                username: session.username.clone(),
            }),
            Some(session.id),
        )
        .await;
    state
        .router
        .broadcast(
            Envelope::new(Body::UserListResponse {
                users: state.registry.users(),
            }),
            Some(session.id),
        )
        .await;
}

/// Encrypt and frame everything queued for this session until every Sender
/// clone is gone or the socket dies.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Envelope>,
    cipher: CipherSession,
) {
    while let Some(envelope) = rx.recv().await {
        let bytes = match envelope.to_bytes().and_then(|b| cipher.encrypt(&b)) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode outbound envelope");
                continue;
            }
        };
        if write_frame(&mut writer, &bytes).await.is_err() {
            break;
        }
    }
}
