//! File transfer coordinator
//!
//! Tracks in-flight transfers between two sessions and enforces the
//! request → accept/reject → chunk → complete ordering. The coordinator
//! relays; it never stores chunk data. Each operation validates and updates
//! the record under the map guard, then hands the caller the survivor's
//! outbound queue to forward into — the guard is never held across an
//! await. Because a sender's handler forwards each chunk into the
//! recipient's bounded queue before reading its next frame, a slow
//! recipient stalls chunk acceptance rather than growing a buffer.

use dashmap::DashMap;
use uuid::Uuid;

use confab_protocol::{Body, Envelope};
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::registry::SessionHandle;

/// Transfer lifecycle. Rejected, completed and cancelled transfers are
/// removed from the table rather than parked in a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferState {
    /// Offered, awaiting the recipient's decision
    Requested,
    /// Accepted, no chunk seen yet
    Accepted,
    /// At least one chunk relayed
    Transferring,
}

struct TransferRecord {
    sender: SessionHandle,
    recipient: SessionHandle,
    file_name: String,
    total_size: u64,
    bytes_transferred: u64,
    next_sequence: u64,
    state: TransferState,
}

/// Shared, internally synchronized transfer table. One per server run.
pub struct Coordinator {
    transfers: DashMap<Uuid, TransferRecord>,
    max_file_size: u64,
    max_chunk_size: usize,
}

impl Coordinator {
    /// Create a coordinator with the configured size limits.
    pub fn new(max_file_size: u64, max_chunk_size: usize) -> Self {
        Coordinator {
            transfers: DashMap::new(),
            max_file_size,
            max_chunk_size,
        }
    }

    /// Register a new transfer offer. Returns the recipient's queue so the
    /// caller can forward the request envelope.
    pub fn request(
        &self,
        sender: &SessionHandle,
        recipient: SessionHandle,
        transfer_id: Uuid,
        file_name: &str,
        total_size: u64,
    ) -> Result<mpsc::Sender<Envelope>, SessionError> {
        if total_size == 0 {
            return Err(SessionError::Violation("zero-size transfer".into()));
        }
        if total_size > self.max_file_size {
            return Err(SessionError::Violation(format!(
                "file of {} bytes exceeds the {} byte limit",
                total_size, self.max_file_size
            )));
        }

        let recipient_tx = recipient.tx.clone();
        match self.transfers.entry(transfer_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(SessionError::Violation("transfer id already in use".into()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(TransferRecord {
                    sender: sender.clone(),
                    recipient,
                    file_name: file_name.to_string(),
                    total_size,
                    bytes_transferred: 0,
                    next_sequence: 0,
                    state: TransferState::Requested,
                });
                Ok(recipient_tx)
            }
        }
    }

    /// Record the recipient's accept/reject decision. Only the designated
    /// recipient may answer, and only while the transfer is REQUESTED.
    /// Returns the original sender's queue for forwarding the decision.
    pub fn respond(
        &self,
        transfer_id: Uuid,
        responder: Uuid,
        accept: bool,
    ) -> Result<mpsc::Sender<Envelope>, SessionError> {
        let mut record = self
            .transfers
            .get_mut(&transfer_id)
            .ok_or_else(|| SessionError::Violation("unknown transfer".into()))?;

        if record.recipient.id != responder {
            return Err(SessionError::Unauthorized);
        }
        if record.state != TransferState::Requested {
            return Err(SessionError::Violation(
                "transfer has already been answered".into(),
            ));
        }

        let sender_tx = record.sender.tx.clone();
        if accept {
            record.state = TransferState::Accepted;
            drop(record);
        } else {
            drop(record);
            self.transfers.remove(&transfer_id);
        }
        Ok(sender_tx)
    }

    /// Account for one chunk and return the recipient's queue to forward
    /// it into. Chunks must arrive from the sender, in sequence, after
    /// acceptance, and must not overrun the declared size.
    pub fn chunk(
        &self,
        transfer_id: Uuid,
        caller: Uuid,
        sequence: u64,
        len: usize,
    ) -> Result<mpsc::Sender<Envelope>, SessionError> {
        let mut record = self
            .transfers
            .get_mut(&transfer_id)
            .ok_or_else(|| SessionError::Violation("unknown or finished transfer".into()))?;

        if record.sender.id != caller {
            return Err(SessionError::Unauthorized);
        }
        if record.state == TransferState::Requested {
            return Err(SessionError::Violation("chunk before acceptance".into()));
        }
        if len > self.max_chunk_size {
            return Err(SessionError::Violation(format!(
                "chunk of {} bytes exceeds the {} byte limit",
                len, self.max_chunk_size
            )));
        }
        if sequence != record.next_sequence {
            return Err(SessionError::Violation(format!(
                "expected chunk {}, got {}",
                record.next_sequence, sequence
            )));
        }
        let new_total = record.bytes_transferred + len as u64;
        if new_total > record.total_size {
            return Err(SessionError::Violation(
                "chunks overrun the declared file size".into(),
            ));
        }

        record.bytes_transferred = new_total;
        record.next_sequence += 1;
        record.state = TransferState::Transferring;
        Ok(record.recipient.tx.clone())
    }

    /// Finish a transfer. Valid only from the sender and only once every
    /// declared byte has been relayed. Removes the record and returns the
    /// recipient's queue for the completion notice.
    pub fn complete(
        &self,
        transfer_id: Uuid,
        caller: Uuid,
    ) -> Result<mpsc::Sender<Envelope>, SessionError> {
        let record = self
            .transfers
            .get(&transfer_id)
            .ok_or_else(|| SessionError::Violation("unknown or finished transfer".into()))?;

        if record.sender.id != caller {
            return Err(SessionError::Unauthorized);
        }
        if record.bytes_transferred != record.total_size {
            return Err(SessionError::Violation(format!(
                "completion before all bytes relayed ({} of {})",
                record.bytes_transferred, record.total_size
            )));
        }

        let recipient_tx = record.recipient.tx.clone();
        drop(record);
        self.transfers.remove(&transfer_id);
        Ok(recipient_tx)
    }

    /// Forcibly cancel every transfer the disconnecting session is a party
    /// to. Returns one (queue, notification) pair per surviving endpoint;
    /// the caller delivers them after the registry has been updated.
    pub fn cancel_for(
        &self,
        session: Uuid,
        username: &str,
    ) -> Vec<(mpsc::Sender<Envelope>, Envelope)> {
        let affected: Vec<Uuid> = self
            .transfers
            .iter()
            .filter(|entry| entry.sender.id == session || entry.recipient.id == session)
            .map(|entry| *entry.key())
            .collect();

        let mut notifications = Vec::with_capacity(affected.len());
        for transfer_id in affected {
            if let Some((_, record)) = self.transfers.remove(&transfer_id) {
                let survivor = if record.sender.id == session {
                    &record.recipient
                } else {
                    &record.sender
                };
                let notice = Envelope::new(Body::FileTransferCancelled {
                    transfer_id,
                    reason: format!("{} disconnected", username),
                });
                notifications.push((survivor.tx.clone(), notice));
                tracing::debug!(
                    %transfer_id,
                    file = %record.file_name,
                    "transfer cancelled by disconnect"
                );
            }
        }
        notifications
    }

    /// Number of live transfer records.
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Whether no transfers are in flight.
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}
