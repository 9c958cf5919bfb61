//! Cryptographic primitives for Speak Without Words.
//!
//! This crate provides:
//! - A buffered PRNG that bridges an async entropy source to sync consumers
//! - Ephemeral X25519 key pairs and HKDF-derived session secrets
//! - An XChaCha20-Poly1305 channel for session payloads
//!
//! # Design
//!
//! Everything except PRNG filling is synchronous and pure. Randomness flows
//! from a single [`CryptoPrng`] into key generation and nonce generation, so
//! no key material can exist before the PRNG has been initialized.
//!
//! Key agreement is unauthenticated; see [`keys`] for the trust model.

#![forbid(unsafe_code)]

pub mod channel;
pub mod keys;
pub mod prng;

pub use channel::{decrypt, encrypt, suite, ChannelError, CipherSuite, Opened, Sealed};
pub use keys::{
    derive_shared_secret, generate_keypair, verification_code, KeyExchangeError, KeyPair,
    PublicKey, SharedSecret,
};
pub use prng::{CryptoPrng, EntropySource, OsEntropy, PrngError, PRNG_BUFFER_SIZE};
