//! Per-connection cipher session
//!
//! Key establishment is an ECIES-style exchange: the client opens with its
//! x25519 public key; the server generates an ephemeral x25519 keypair and
//! a fresh random AES-256 session key, wraps the session key under a key
//! derived from the DH shared secret, and returns both. Every envelope
//! after the handshake is AES-256-GCM encrypted under the session key, so
//! tampering or corruption fails authentication rather than producing
//! garbage plaintext.
//!
//! Key material is never logged and never appears in error values.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, SharedSecret};
use zeroize::Zeroize;

use crate::error::{ProtocolError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Session key length in bytes (AES-256)
pub const SESSION_KEY_LEN: usize = 32;

/// AES-GCM nonce length in bytes
const NONCE_LEN: usize = 12;

/// Server half of a completed key exchange: the material the client needs
/// to recover the session key. Maps onto the SESSION_KEY envelope body.
pub struct KeyOffer {
    /// Server ephemeral x25519 public key
    pub public_key: Vec<u8>,
    /// `nonce || AES-256-GCM(session key)` under the DH-derived wrap key
    pub wrapped_key: Vec<u8>,
}

/// Symmetric encryption state for one connection.
///
/// Cheap to clone; the reader and writer halves of a connection each hold
/// one.
#[derive(Clone)]
pub struct CipherSession {
    cipher: Aes256Gcm,
}

impl CipherSession {
    /// Build a session from raw key bytes.
    fn from_key(key: &[u8; SESSION_KEY_LEN]) -> Self {
        CipherSession {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypt an envelope payload. Returns `nonce || ciphertext+tag` with
    /// a fresh random nonce per message.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| ProtocolError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt `nonce || ciphertext+tag`. Fails with
    /// [`ProtocolError::Decryption`] on any tamper or corruption.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN + 16 {
            return Err(ProtocolError::Decryption);
        }
        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
        self.cipher
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|_| ProtocolError::Decryption)
    }
}

// No Debug derive: the cipher state must never end up in logs.
impl std::fmt::Debug for CipherSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherSession")
    }
}

/// Derive the key-wrap key from the DH shared secret.
fn derive_wrap_key(shared: &SharedSecret) -> [u8; SESSION_KEY_LEN] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(shared.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(b"confab-key-wrap-v1");
    mac.finalize().into_bytes().into()
}

/// Server side of the handshake: answer a client's KEY_EXCHANGE.
///
/// Generates the ephemeral keypair and the fresh session key, wraps the
/// session key for the client, and zeroizes intermediates before
/// returning.
pub fn accept_key_exchange(client_public: &[u8]) -> Result<(CipherSession, KeyOffer)> {
    let client_bytes: [u8; 32] = client_public
        .try_into()
        .map_err(|_| ProtocolError::InvalidKey("client public key must be 32 bytes".into()))?;
    let client_key = X25519PublicKey::from(client_bytes);

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let server_public = X25519PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&client_key);
    if !shared.was_contributory() {
        return Err(ProtocolError::InvalidKey("low-order client public key".into()));
    }

    let mut wrap_key = derive_wrap_key(&shared);
    let wrap_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&wrap_key));

    let mut session_key = [0u8; SESSION_KEY_LEN];
    OsRng.fill_bytes(&mut session_key);

    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let wrapped = wrap_cipher
        .encrypt(nonce, session_key.as_ref())
        .map_err(|e| ProtocolError::Encryption(e.to_string()))?;

    let session = CipherSession::from_key(&session_key);
    session_key.zeroize();
    wrap_key.zeroize();

    let mut wrapped_key = Vec::with_capacity(NONCE_LEN + wrapped.len());
    wrapped_key.extend_from_slice(&nonce_bytes);
    wrapped_key.extend_from_slice(&wrapped);

    Ok((
        session,
        KeyOffer {
            public_key: server_public.as_bytes().to_vec(),
            wrapped_key,
        },
    ))
}

/// Client side of the handshake.
pub struct ClientHandshake {
    secret: EphemeralSecret,
}

impl ClientHandshake {
    /// Generate the client keypair. Returns the handshake state and the
    /// public key bytes to send in KEY_EXCHANGE.
    pub fn start() -> (Self, Vec<u8>) {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret).as_bytes().to_vec();
        (ClientHandshake { secret }, public)
    }

    /// Unwrap the server's SESSION_KEY offer into a live cipher session.
    pub fn finish(self, server_public: &[u8], wrapped_key: &[u8]) -> Result<CipherSession> {
        let server_bytes: [u8; 32] = server_public
            .try_into()
            .map_err(|_| ProtocolError::InvalidKey("server public key must be 32 bytes".into()))?;
        let shared = self.secret.diffie_hellman(&X25519PublicKey::from(server_bytes));
        if !shared.was_contributory() {
            return Err(ProtocolError::InvalidKey("low-order server public key".into()));
        }

        let mut wrap_key = derive_wrap_key(&shared);
        let wrap_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&wrap_key));
        wrap_key.zeroize();

        if wrapped_key.len() < NONCE_LEN + 16 {
            return Err(ProtocolError::Decryption);
        }
        let nonce = Nonce::from_slice(&wrapped_key[..NONCE_LEN]);
        let mut session_key_bytes = wrap_cipher
            .decrypt(nonce, &wrapped_key[NONCE_LEN..])
            .map_err(|_| ProtocolError::Decryption)?;

        if session_key_bytes.len() != SESSION_KEY_LEN {
            session_key_bytes.zeroize();
            return Err(ProtocolError::InvalidKey("wrapped key has wrong length".into()));
        }

        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(&session_key_bytes);
        session_key_bytes.zeroize();

        let session = CipherSession::from_key(&key);
        key.zeroize();
        Ok(session)
    }
}
