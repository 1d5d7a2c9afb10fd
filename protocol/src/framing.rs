//! Length-prefixed framing over a reliable byte stream
//!
//! Each frame is a `u32` big-endian length followed by that many payload
//! bytes. Before the handshake completes the payload is a plaintext JSON
//! envelope; afterwards it is `nonce || ciphertext` produced by the cipher
//! session. A zero-length or oversized prefix means the stream is no longer
//! trustworthy and the connection must be dropped.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

/// Default per-frame size limit (1 MiB), matching the server's default
/// `max_frame_size` configuration.
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        got: payload.len(),
        limit: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary. An EOF
/// in the middle of a frame, an empty frame, or a length above `max_len`
/// is an error.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(ProtocolError::Codec("empty frame".into()));
    }
    if len > max_len {
        return Err(ProtocolError::FrameTooLarge {
            got: len,
            limit: max_len,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
