//! Ephemeral X25519 key pairs and shared secret derivation.
//!
//! Key agreement here is unauthenticated. Nothing in this module proves who
//! owns a remote public key: the out-of-band advertisement (QR code or typed
//! session code) is the only trust anchor. An active attacker who can swap
//! the advertisement can sit in the middle of the exchange.
//! [`verification_code`] gives both users a short string they can compare
//! to detect that, but nothing here enforces the comparison.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::prng::{CryptoPrng, PrngError};

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Derived session secret size.
pub const SHARED_SECRET_SIZE: usize = 32;

const SESSION_KEY_INFO: &[u8] = b"sww-session-key-v1";
const VERIFICATION_INFO: &[u8] = b"sww-verification-v1";

/// Key exchange errors.
#[derive(Debug, Error)]
pub enum KeyExchangeError {
    #[error("PRNG not ready: {0}")]
    PrngNotReady(#[from] PrngError),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("key derivation failed")]
    Derivation,
}

/// A peer's X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Wrap raw bytes. Rejects the all-zero identity point.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Result<Self, KeyExchangeError> {
        if bytes.iter().all(|b| *b == 0) {
            return Err(KeyExchangeError::InvalidPublicKey(
                "identity element".into(),
            ));
        }
        Ok(Self(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyExchangeError> {
        let arr: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
            KeyExchangeError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_SIZE,
                bytes.len()
            ))
        })?;
        Self::from_bytes(arr)
    }

    /// Decode from standard base64.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyExchangeError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| KeyExchangeError::InvalidPublicKey(format!("bad base64: {e}")))?;
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Short hex fingerprint (first 4 bytes of SHA-256), safe for logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..4])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// 32-byte symmetric secret shared by both peers.
///
/// Not `Clone`: the session that derived it is its only owner.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_SIZE]);

impl SharedSecret {
    /// Wrap existing key bytes. Mostly useful in tests.
    pub fn from_bytes(bytes: [u8; SHARED_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.0
    }

    /// True after `zeroize()` (or for an all-zero key).
    pub fn is_zeroed(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Ephemeral key pair for a single session.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a key pair from PRNG bytes.
    ///
    /// Fails with `PrngNotReady` if the PRNG has not been initialized or
    /// cannot supply 32 bytes.
    pub fn generate<S>(prng: &mut CryptoPrng<S>) -> Result<Self, KeyExchangeError> {
        let mut seed = Zeroizing::new([0u8; 32]);
        prng.fill(&mut seed[..])?;

        let secret = StaticSecret::from(*seed);
        let public = x25519_dalek::PublicKey::from(&secret);

        Ok(Self {
            secret,
            public: PublicKey(public.to_bytes()),
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Derive the session secret shared with `remote`.
    pub fn derive_shared_secret(&self, remote: &PublicKey) -> Result<SharedSecret, KeyExchangeError> {
        let dh = self
            .secret
            .diffie_hellman(&x25519_dalek::PublicKey::from(*remote.as_bytes()));

        if !dh.was_contributory() {
            return Err(KeyExchangeError::InvalidPublicKey(
                "low-order point".into(),
            ));
        }

        let (lo, hi) = ordered(&self.public, remote);
        let mut info = Vec::with_capacity(SESSION_KEY_INFO.len() + 2 * PUBLIC_KEY_SIZE);
        info.extend_from_slice(SESSION_KEY_INFO);
        info.extend_from_slice(lo.as_bytes());
        info.extend_from_slice(hi.as_bytes());

        let hk = Hkdf::<Sha256>::new(None, dh.as_bytes());
        let mut okm = Zeroizing::new([0u8; SHARED_SECRET_SIZE]);
        hk.expand(&info, &mut okm[..])
            .map_err(|_| KeyExchangeError::Derivation)?;

        Ok(SharedSecret(*okm))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Generate a fresh ephemeral key pair.
pub fn generate_keypair<S>(prng: &mut CryptoPrng<S>) -> Result<KeyPair, KeyExchangeError> {
    KeyPair::generate(prng)
}

/// `derive(A.private, B.public) == derive(B.private, A.public)`.
pub fn derive_shared_secret(
    local: &KeyPair,
    remote: &PublicKey,
) -> Result<SharedSecret, KeyExchangeError> {
    local.derive_shared_secret(remote)
}

/// Six-digit code both users can compare out of band.
///
/// Order-independent: both sides compute the same value from the two public
/// keys. A mismatch means someone replaced a key in transit.
pub fn verification_code(a: &PublicKey, b: &PublicKey) -> String {
    let (lo, hi) = ordered(a, b);

    let mut hasher = Sha256::new();
    hasher.update(VERIFICATION_INFO);
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());
    let digest = hasher.finalize();

    let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("{:06}", value % 1_000_000)
}

fn ordered<'a>(a: &'a PublicKey, b: &'a PublicKey) -> (&'a PublicKey, &'a PublicKey) {
    if a.as_bytes() <= b.as_bytes() {
        (a, b)
    } else {
        (b, a)
    }
}
