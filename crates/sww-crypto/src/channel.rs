//! Authenticated symmetric encryption for session payloads.
//!
//! XChaCha20-Poly1305 with a fresh 24-byte nonce per message drawn from the
//! PRNG. The channel holds no state: the shared secret is passed in on every
//! call and nothing is retained afterwards.
//!
//! Structural problems (wrong nonce length, ciphertext shorter than the tag,
//! missing key) are errors. A well-formed message that fails authentication
//! is not an error: it comes back as [`Opened::Discarded`] and must be
//! dropped, never retried.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::keys::SharedSecret;
use crate::prng::{CryptoPrng, PrngError};

/// Key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Nonce size in bytes.
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag overhead in bytes.
pub const TAG_SIZE: usize = 16;

/// Channel errors. Authentication failure is not one of them.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel not ready: no shared secret")]
    NotReady,

    #[error("nonce generation failed: {0}")]
    Nonce(#[from] PrngError),

    #[error("invalid nonce length: expected {NONCE_SIZE}, got {0}")]
    InvalidNonceLength(usize),

    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    #[error("encryption failed")]
    EncryptionFailed,
}

/// Output of [`encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
}

/// Outcome of [`decrypt`] on structurally valid input.
#[derive(Debug)]
pub enum Opened {
    Plaintext(Zeroizing<Vec<u8>>),
    /// Tag mismatch: tampered, wrong key, or corrupted in transit.
    Discarded,
}

impl Opened {
    pub fn into_plaintext(self) -> Option<Zeroizing<Vec<u8>>> {
        match self {
            Opened::Plaintext(p) => Some(p),
            Opened::Discarded => None,
        }
    }

    pub fn is_discarded(&self) -> bool {
        matches!(self, Opened::Discarded)
    }
}

/// Algorithm description for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuite {
    pub key_agreement: &'static str,
    pub kdf: &'static str,
    pub aead: &'static str,
    pub key_size: usize,
    pub nonce_size: usize,
    pub tag_size: usize,
}

/// The suite used by every session.
pub fn suite() -> CipherSuite {
    CipherSuite {
        key_agreement: "X25519",
        kdf: "HKDF-SHA256",
        aead: "XChaCha20-Poly1305",
        key_size: KEY_SIZE,
        nonce_size: NONCE_SIZE,
        tag_size: TAG_SIZE,
    }
}

fn cipher(secret: &SharedSecret) -> Result<XChaCha20Poly1305, ChannelError> {
    if secret.is_zeroed() {
        return Err(ChannelError::NotReady);
    }
    Ok(XChaCha20Poly1305::new(Key::from_slice(secret.as_bytes())))
}

/// Encrypt `plaintext` under `secret`, binding `aad` to the tag.
///
/// Draws the nonce from `prng`; the caller is responsible for keeping the
/// PRNG filled.
pub fn encrypt<S>(
    plaintext: &[u8],
    aad: &[u8],
    secret: &SharedSecret,
    prng: &mut CryptoPrng<S>,
) -> Result<Sealed, ChannelError> {
    let cipher = cipher(secret)?;

    let mut nonce = [0u8; NONCE_SIZE];
    prng.fill(&mut nonce)?;

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| ChannelError::EncryptionFailed)?;

    Ok(Sealed { ciphertext, nonce })
}

/// Verify and decrypt.
///
/// Format violations are rejected before any cryptographic work.
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &[u8],
    aad: &[u8],
    secret: &SharedSecret,
) -> Result<Opened, ChannelError> {
    if nonce.len() != NONCE_SIZE {
        return Err(ChannelError::InvalidNonceLength(nonce.len()));
    }
    if ciphertext.len() < TAG_SIZE {
        return Err(ChannelError::CiphertextTooShort(ciphertext.len()));
    }

    let cipher = cipher(secret)?;

    match cipher.decrypt(
        XNonce::from_slice(nonce),
        Payload {
            msg: ciphertext,
            aad,
        },
    ) {
        Ok(plaintext) => Ok(Opened::Plaintext(Zeroizing::new(plaintext))),
        Err(_) => Ok(Opened::Discarded),
    }
}
