//! Session lifecycle and state machine.
//!
//! - IDLE: no session
//! - ADVERTISING: host has a key pair and a code, waiting for a guest key
//! - SCANNING: guest has a key pair and the host's advertisement
//! - KEY_EXCHANGED: shared secret derived, channel usable
//! - EXPIRED: past `expires_at`, never usable again
//! - CLOSED: explicitly closed, key material wiped
//!
//! The manager is the only owner of the key pair and the shared secret.

use std::fmt;

use thiserror::Error;
use zeroize::Zeroize;

use sww_common::helpers::constant_time_eq;
use sww_common::SessionCode;
use sww_crypto::channel::{self, ChannelError, Opened, Sealed};
use sww_crypto::keys::{self, KeyExchangeError, KeyPair, PublicKey, SharedSecret};
use sww_crypto::prng::{CryptoPrng, PrngError};

/// Session state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Advertising,
    Scanning,
    KeyExchanged,
    Expired,
    Closed,
}

impl SessionState {
    /// Waiting for the peer's key.
    pub fn is_pending(&self) -> bool {
        matches!(self, SessionState::Advertising | SessionState::Scanning)
    }

    /// No live session: a new one may be created.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Expired | SessionState::Closed
        )
    }
}

/// Which side of the pairing this device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Guest,
}

/// Shared secret presence, explicit instead of an `Option` flag.
pub enum SecretState {
    NoSecret,
    HasSecret(SharedSecret),
}

impl SecretState {
    pub fn is_present(&self) -> bool {
        matches!(self, SecretState::HasSecret(_))
    }

    fn wipe(&mut self) {
        if let SecretState::HasSecret(secret) = self {
            secret.zeroize();
        }
        *self = SecretState::NoSecret;
    }
}

impl fmt::Debug for SecretState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretState::NoSecret => f.write_str("NoSecret"),
            SecretState::HasSecret(_) => f.write_str("HasSecret(<redacted>)"),
        }
    }
}

/// Why `complete_exchange` refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeFailure {
    Expired,
    Closed,
    /// No pending session to complete.
    InvalidState(SessionState),
    InvalidPublicKey(String),
    /// A different peer key arrived after the exchange completed.
    KeyMismatch,
}

impl fmt::Display for ExchangeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeFailure::Expired => f.write_str("session expired"),
            ExchangeFailure::Closed => f.write_str("session closed"),
            ExchangeFailure::InvalidState(state) => write!(f, "no pending session ({state:?})"),
            ExchangeFailure::InvalidPublicKey(msg) => write!(f, "invalid public key: {msg}"),
            ExchangeFailure::KeyMismatch => f.write_str("peer key changed after exchange"),
        }
    }
}

/// Session management errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("PRNG not ready: {0}")]
    PrngNotReady(PrngError),

    #[error("a session is already active ({0:?})")]
    AlreadyActive(SessionState),

    #[error("key exchange failed: {0}")]
    ExchangeFailed(ExchangeFailure),

    #[error("session expired")]
    Expired,

    #[error("channel not ready")]
    ChannelNotReady,

    #[error("malformed ciphertext: {0}")]
    Format(ChannelError),
}

impl From<KeyExchangeError> for SessionError {
    fn from(err: KeyExchangeError) -> Self {
        match err {
            KeyExchangeError::PrngNotReady(e) => SessionError::PrngNotReady(e),
            KeyExchangeError::InvalidPublicKey(msg) => {
                SessionError::ExchangeFailed(ExchangeFailure::InvalidPublicKey(msg))
            }
            KeyExchangeError::Derivation => SessionError::ExchangeFailed(
                ExchangeFailure::InvalidPublicKey("derivation failed".into()),
            ),
        }
    }
}

impl From<ChannelError> for SessionError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::NotReady => SessionError::ChannelNotReady,
            ChannelError::Nonce(e) => SessionError::PrngNotReady(e),
            other => SessionError::Format(other),
        }
    }
}

/// Result of a successful `complete_exchange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// Secret derived now.
    Established,
    /// Same key seen again; nothing changed.
    AlreadyEstablished,
}

/// A live session.
struct Session {
    code: SessionCode,
    role: Role,
    /// Dropped, and so zeroized, on expiry.
    key_pair: Option<KeyPair>,
    local_public_key: PublicKey,
    remote_public_key: Option<PublicKey>,
    secret: SecretState,
    created_at: u64,
    expires_at: u64,
}

/// Owns the current session, its key pair and its shared secret.
pub struct SessionManager {
    state: SessionState,
    session: Option<Session>,
    ttl_ms: u64,
}

impl SessionManager {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            state: SessionState::Idle,
            session: None,
            ttl_ms,
        }
    }

    /// Host side: new key pair and session code, Idle -> Advertising.
    ///
    /// The PRNG must hold at least 32 bytes for the key pair plus a few for
    /// the code.
    pub fn create_session<S>(
        &mut self,
        prng: &mut CryptoPrng<S>,
        now_ms: u64,
    ) -> Result<SessionCode, SessionError> {
        self.ensure_idle()?;

        let key_pair = keys::generate_keypair(prng)?;
        let code = SessionCode::generate(|| prng.next_bytes(1).map(|b| b[0]))
            .map_err(SessionError::PrngNotReady)?;

        tracing::info!(
            "session {} created (host key {})",
            code,
            key_pair.public_key().fingerprint()
        );

        self.install(code.clone(), Role::Host, key_pair, now_ms);
        self.state = SessionState::Advertising;
        Ok(code)
    }

    /// Guest side: new key pair for the host's session, Idle -> Scanning.
    pub fn join_session<S>(
        &mut self,
        code: SessionCode,
        prng: &mut CryptoPrng<S>,
        now_ms: u64,
    ) -> Result<PublicKey, SessionError> {
        self.ensure_idle()?;

        let key_pair = keys::generate_keypair(prng)?;
        let public = *key_pair.public_key();
        tracing::info!(
            "joining session {} (guest key {})",
            code,
            key_pair.public_key().fingerprint()
        );

        self.install(code, Role::Guest, key_pair, now_ms);
        self.state = SessionState::Scanning;
        Ok(public)
    }

    /// Derive the shared secret from the peer's key.
    ///
    /// Idempotent: the same key again returns `AlreadyEstablished` without
    /// re-deriving.
    pub fn complete_exchange(
        &mut self,
        remote: &PublicKey,
        now_ms: u64,
    ) -> Result<ExchangeOutcome, SessionError> {
        match self.state {
            SessionState::Closed => {
                return Err(SessionError::ExchangeFailed(ExchangeFailure::Closed));
            }
            SessionState::Expired => {
                return Err(SessionError::ExchangeFailed(ExchangeFailure::Expired));
            }
            SessionState::Idle => {
                return Err(SessionError::ExchangeFailed(ExchangeFailure::InvalidState(
                    SessionState::Idle,
                )));
            }
            _ => {}
        }

        if self.expire_if_due(now_ms) {
            return Err(SessionError::ExchangeFailed(ExchangeFailure::Expired));
        }

        let state = self.state;
        let Some(session) = self.session.as_mut() else {
            return Err(SessionError::ExchangeFailed(ExchangeFailure::InvalidState(
                state,
            )));
        };

        if state == SessionState::KeyExchanged {
            return match &session.remote_public_key {
                Some(existing) if constant_time_eq(existing.as_bytes(), remote.as_bytes()) => {
                    Ok(ExchangeOutcome::AlreadyEstablished)
                }
                _ => Err(SessionError::ExchangeFailed(ExchangeFailure::KeyMismatch)),
            };
        }

        if session.local_public_key == *remote {
            return Err(SessionError::ExchangeFailed(
                ExchangeFailure::InvalidPublicKey("peer key equals our own".into()),
            ));
        }

        let Some(key_pair) = session.key_pair.as_ref() else {
            return Err(SessionError::ExchangeFailed(ExchangeFailure::Expired));
        };
        let secret = key_pair.derive_shared_secret(remote)?;
        session.remote_public_key = Some(*remote);
        session.secret = SecretState::HasSecret(secret);
        self.state = SessionState::KeyExchanged;

        tracing::info!(
            "session {} key exchanged with {}",
            session.code,
            remote.fingerprint()
        );
        Ok(ExchangeOutcome::Established)
    }

    /// True once `now_ms` is past the session's expiry.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match (&self.state, &self.session) {
            (SessionState::Expired, _) => true,
            (_, Some(session)) => now_ms > session.expires_at,
            _ => false,
        }
    }

    /// Wipe all key material and move to Closed. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.secret.wipe();
            tracing::info!("session {} closed", session.code);
            // Dropping the key pair zeroizes the private scalar.
        }
        self.state = SessionState::Closed;
    }

    /// Encrypt under the session secret.
    pub fn encrypt<S>(
        &mut self,
        plaintext: &[u8],
        aad: &[u8],
        prng: &mut CryptoPrng<S>,
        now_ms: u64,
    ) -> Result<Sealed, SessionError> {
        let secret = self.usable_secret(now_ms)?;
        Ok(channel::encrypt(plaintext, aad, secret, prng)?)
    }

    /// Decrypt under the session secret. Authentication failure is
    /// `Opened::Discarded`, not an error.
    pub fn decrypt(
        &mut self,
        ciphertext: &[u8],
        nonce: &[u8],
        aad: &[u8],
        now_ms: u64,
    ) -> Result<Opened, SessionError> {
        let secret = self.usable_secret(now_ms)?;
        Ok(channel::decrypt(ciphertext, nonce, aad, secret)?)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.session.as_ref().map(|s| s.role)
    }

    pub fn code(&self) -> Option<&SessionCode> {
        self.session.as_ref().map(|s| &s.code)
    }

    pub fn local_public_key(&self) -> Option<&PublicKey> {
        self.session.as_ref().map(|s| &s.local_public_key)
    }

    pub fn remote_public_key(&self) -> Option<&PublicKey> {
        self.session.as_ref().and_then(|s| s.remote_public_key.as_ref())
    }

    pub fn created_at(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.created_at)
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.expires_at)
    }

    /// Whether the private key is still held. False once expired or closed.
    pub fn has_private_key(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.key_pair.is_some())
            .unwrap_or(false)
    }

    pub fn has_secret(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.secret.is_present())
            .unwrap_or(false)
    }

    /// Six-digit code for comparing keys out of band, once exchanged.
    pub fn verification_code(&self) -> Option<String> {
        let session = self.session.as_ref()?;
        let remote = session.remote_public_key.as_ref()?;
        Some(keys::verification_code(&session.local_public_key, remote))
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            Ok(())
        } else {
            Err(SessionError::AlreadyActive(self.state))
        }
    }

    fn install(&mut self, code: SessionCode, role: Role, key_pair: KeyPair, now_ms: u64) {
        self.session = Some(Session {
            code,
            role,
            local_public_key: *key_pair.public_key(),
            key_pair: Some(key_pair),
            remote_public_key: None,
            secret: SecretState::NoSecret,
            created_at: now_ms,
            expires_at: now_ms.saturating_add(self.ttl_ms),
        });
    }

    /// Move to Expired and wipe the secret and private key if the deadline
    /// has passed.
    fn expire_if_due(&mut self, now_ms: u64) -> bool {
        if self.state == SessionState::Expired {
            return true;
        }
        let due = matches!(&self.session, Some(s) if now_ms > s.expires_at);
        if due {
            if let Some(session) = self.session.as_mut() {
                session.secret.wipe();
                session.key_pair = None;
                tracing::warn!("session {} expired", session.code);
            }
            self.state = SessionState::Expired;
        }
        due
    }

    fn usable_secret(&mut self, now_ms: u64) -> Result<&SharedSecret, SessionError> {
        if self.expire_if_due(now_ms) {
            return Err(SessionError::Expired);
        }
        match self.session.as_ref().map(|s| &s.secret) {
            Some(SecretState::HasSecret(secret)) => Ok(secret),
            _ => Err(SessionError::ChannelNotReady),
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("state", &self.state)
            .field("code", &self.code())
            .field("role", &self.role())
            .field("secret", &self.session.as_ref().map(|s| &s.secret))
            .finish()
    }
}
