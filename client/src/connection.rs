//! Encrypted connection to a Confab server

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use confab_protocol::{
    read_frame, write_frame, Body, CipherSession, ClientHandshake, Envelope, DEFAULT_MAX_FRAME,
};

use crate::error::ClientError;

/// An established, encrypted session with the server.
///
/// All traffic after [`Connection::connect`] returns is encrypted with the
/// session key negotiated during the key exchange.
pub struct Connection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    cipher: CipherSession,
    max_frame: usize,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a TCP connection and complete the key exchange.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = stream.into_split();

        let (handshake, public_key) = ClientHandshake::start();
        let hello = Envelope::new(Body::KeyExchange { public_key });
        write_frame(&mut writer, &hello.to_bytes()?).await?;

        let frame = read_frame(&mut reader, DEFAULT_MAX_FRAME)
            .await?
            .ok_or(ClientError::ConnectionClosed)?;
        let reply = Envelope::from_bytes(&frame)?;

        match reply.body {
            Body::SessionKey {
                public_key,
                wrapped_key,
            } => {
                let cipher = handshake.finish(&public_key, &wrapped_key)?;
                Ok(Connection {
                    reader,
                    writer,
                    cipher,
                    max_frame: DEFAULT_MAX_FRAME,
                })
            }
            // The server refuses at capacity with a plaintext error.
            Body::Error { code, message } => Err(ClientError::Server { code, message }),
            other => Err(ClientError::UnexpectedMessage(other.type_name())),
        }
    }

    /// Register a username. On success returns the current user list.
    pub async fn login(&mut self, username: &str) -> Result<Vec<String>, ClientError> {
        self.send(Envelope::new(Body::AuthRequest {
            username: username.to_string(),
        }))
        .await?;

        loop {
            let envelope = self.recv().await?;
            match envelope.body {
                Body::AuthResponse {
                    accepted: true,
                    users,
                    ..
                } => return Ok(users),
                Body::AuthResponse {
                    accepted: false,
                    reason,
                    ..
                } => {
                    return Err(ClientError::AuthRejected(
                        reason.unwrap_or_else(|| "no reason given".to_string()),
                    ))
                }
                Body::Error { code, message } => return Err(ClientError::Server { code, message }),
                // Room traffic can already be in flight; skip it.
                _ => continue,
            }
        }
    }

    /// Encrypt and send one envelope.
    pub async fn send(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        let ciphertext = self.cipher.encrypt(&envelope.to_bytes()?)?;
        write_frame(&mut self.writer, &ciphertext).await?;
        Ok(())
    }

    /// Receive and decrypt the next envelope.
    pub async fn recv(&mut self) -> Result<Envelope, ClientError> {
        let frame = read_frame(&mut self.reader, self.max_frame)
            .await?
            .ok_or(ClientError::ConnectionClosed)?;
        let plaintext = self.cipher.decrypt(&frame)?;
        Ok(Envelope::from_bytes(&plaintext)?)
    }

    /// Announce an orderly departure. The socket closes on drop.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        self.send(Envelope::new(Body::Disconnect)).await
    }

    /// Split into independently owned read and write halves, for running
    /// a receive loop concurrently with user input.
    pub fn into_split(self) -> (ConnectionReader, ConnectionWriter) {
        (
            ConnectionReader {
                reader: self.reader,
                cipher: self.cipher.clone(),
                max_frame: self.max_frame,
            },
            ConnectionWriter {
                writer: self.writer,
                cipher: self.cipher,
            },
        )
    }
}

/// Receiving half of a split [`Connection`].
pub struct ConnectionReader {
    reader: OwnedReadHalf,
    cipher: CipherSession,
    max_frame: usize,
}

impl ConnectionReader {
    /// Receive and decrypt the next envelope.
    pub async fn recv(&mut self) -> Result<Envelope, ClientError> {
        let frame = read_frame(&mut self.reader, self.max_frame)
            .await?
            .ok_or(ClientError::ConnectionClosed)?;
        let plaintext = self.cipher.decrypt(&frame)?;
        Ok(Envelope::from_bytes(&plaintext)?)
    }
}

/// Sending half of a split [`Connection`].
pub struct ConnectionWriter {
    writer: OwnedWriteHalf,
    cipher: CipherSession,
}

impl ConnectionWriter {
    /// Encrypt and send one envelope.
    pub async fn send(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        let ciphertext = self.cipher.encrypt(&envelope.to_bytes()?)?;
        write_frame(&mut self.writer, &ciphertext).await?;
        Ok(())
    }
}
