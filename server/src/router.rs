//! Message routing for authenticated sessions
//!
//! The router owns no connection state. It validates each inbound envelope
//! against the registry and the transfer coordinator, stamps the sender,
//! and forwards into the recipients' outbound queues. Registry snapshots
//! are taken before any send so no lock is held across an await. Sends
//! await queue capacity: a full recipient queue applies backpressure to
//! the sending session instead of buffering server-side.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use confab_protocol::{Body, Envelope};

use crate::error::SessionError;
use crate::registry::{Registry, SessionHandle};
use crate::transfer::Coordinator;

/// Stateless dispatcher over the registry and transfer coordinator.
pub struct Router {
    registry: Arc<Registry>,
    transfers: Arc<Coordinator>,
}

impl Router {
    /// Build a router over the shared server state.
    pub fn new(registry: Arc<Registry>, transfers: Arc<Coordinator>) -> Self {
        Router { registry, transfers }
    }

    /// Dispatch one envelope from an authenticated session.
    ///
    /// Errors are reported to the offending session only; the caller turns
    /// the returned [`SessionError`] into an ERROR envelope.
    pub async fn route(
        &self,
        session: &SessionHandle,
        envelope: Envelope,
    ) -> Result<(), SessionError> {
        let Envelope { id, timestamp, body, .. } = envelope;
        let sender = session.username.clone();

        match body {
            Body::PublicMessage { content } => {
                if timestamp.is_none() {
                    return Err(SessionError::Violation(
                        "public message without a timestamp".into(),
                    ));
                }
                let peers = self.registry.peers(session.id);
                tracing::debug!(from = %sender, fanout = peers.len(), "public message");
                let env = Envelope {
                    id,
                    sender: Some(sender),
                    timestamp,
                    body: Body::PublicMessage { content },
                };
                for peer in peers {
                    deliver(&peer.tx, env.clone()).await;
                }
                Ok(())
            }

            Body::PrivateMessage { recipient, content } => {
                let target = self
                    .registry
                    .resolve(&recipient)
                    .ok_or_else(|| SessionError::UnknownRecipient(recipient.clone()))?;
                tracing::debug!(from = %sender, to = %recipient, "private message");
                let env = Envelope {
                    id,
                    sender: Some(sender),
                    timestamp,
                    body: Body::PrivateMessage { recipient, content },
                };
                deliver(&target.tx, env).await;
                Ok(())
            }

            Body::UserListRequest => {
                let users = self.registry.users();
                deliver(
                    &session.tx,
                    Envelope::new(Body::UserListResponse { users }),
                )
                .await;
                Ok(())
            }

            Body::FileTransferRequest {
                transfer_id,
                recipient,
                file_name,
                total_size,
            } => {
                let target = self
                    .registry
                    .resolve(&recipient)
                    .ok_or_else(|| SessionError::RecipientOffline(recipient.clone()))?;
                let tx = self.transfers.request(
                    session,
                    target,
                    transfer_id,
                    &file_name,
                    total_size,
                )?;
                tracing::info!(
                    %transfer_id,
                    from = %sender,
                    to = %recipient,
                    file = %file_name,
                    size = total_size,
                    "file transfer offered"
                );
                let env = Envelope {
                    id,
                    sender: Some(sender),
                    timestamp,
                    body: Body::FileTransferRequest {
                        transfer_id,
                        recipient,
                        file_name,
                        total_size,
                    },
                };
                deliver(&tx, env).await;
                Ok(())
            }

            Body::FileTransferResponse { transfer_id, accepted } => {
                let tx = self.transfers.respond(transfer_id, session.id, accepted)?;
                tracing::info!(%transfer_id, from = %sender, accepted, "transfer answered");
                let env = Envelope {
                    id,
                    sender: Some(sender),
                    timestamp,
                    body: Body::FileTransferResponse { transfer_id, accepted },
                };
                deliver(&tx, env).await;
                Ok(())
            }

            Body::FileChunk {
                transfer_id,
                sequence,
                data,
            } => {
                let tx = self
                    .transfers
                    .chunk(transfer_id, session.id, sequence, data.len())?;
                let env = Envelope {
                    id,
                    sender: Some(sender),
                    timestamp,
                    body: Body::FileChunk {
                        transfer_id,
                        sequence,
                        data,
                    },
                };
                deliver(&tx, env).await;
                Ok(())
            }

            Body::FileTransferComplete { transfer_id } => {
                let tx = self.transfers.complete(transfer_id, session.id)?;
                tracing::info!(%transfer_id, from = %sender, "transfer complete");
                let env = Envelope {
                    id,
                    sender: Some(sender),
                    timestamp,
                    body: Body::FileTransferComplete { transfer_id },
                };
                deliver(&tx, env).await;
                Ok(())
            }

            other => Err(SessionError::Violation(format!(
                "unexpected {} from an authenticated client",
                other.type_name()
            ))),
        }
    }

    /// Deliver a server-originated envelope to every active session,
    /// optionally skipping one connection.
    pub async fn broadcast(&self, envelope: Envelope, exclude: Option<Uuid>) {
        let targets = match exclude {
            Some(id) => self.registry.peers(id),
            None => self.registry.all(),
        };
        for target in targets {
            deliver(&target.tx, envelope.clone()).await;
        }
    }
}

/// Push an envelope into a session's outbound queue. A closed queue means
/// the session is tearing down; the message is dropped.
async fn deliver(tx: &mpsc::Sender<Envelope>, envelope: Envelope) {
    if tx.send(envelope).await.is_err() {
        tracing::trace!("dropped envelope for a departing session");
    }
}
