//! Connection coordination.
//!
//! `ConnectionCoordinator` drives one pairing at a time:
//!
//! ```text
//! Disconnected -> Advertising (host) | Connecting (guest) -> Connected -> Disconnected
//!                                                  Connected -> Degraded -> Connected
//!                                                  Connected -> Error -> Disconnected
//! ```
//!
//! # Concurrency
//!
//! Relay callbacks arrive synchronously from the mailbox, possibly on another
//! task. All mutable state sits behind one `std::sync::Mutex` that is never
//! held across an `.await` or while calling into the mailbox or listeners.
//! Handlers compute a list of [`Action`]s under the lock and run them after
//! releasing it. Every teardown bumps a generation counter; callbacks and
//! in-flight operations carry the generation they started with and become
//! no-ops once it has moved on.
//!
//! The PRNG lives behind an async mutex and is always locked before the
//! state lock, never after.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use sww_common::{
    AdvertisementError, DeviceId, EncryptedEnvelope, Payload, ProtocolConfig, RecordStatus,
    SessionAdvertisement, SessionCode, SessionRecord, SessionRecordUpdate,
};
use sww_crypto::channel::{Opened, NONCE_SIZE};
use sww_crypto::keys::{PublicKey, PUBLIC_KEY_SIZE};
use sww_crypto::prng::{CryptoPrng, EntropySource, OsEntropy, PrngError};

use crate::env::{Clock, SystemClock};
use crate::events::{DisconnectReason, Event, EventHub, InboundMessage};
use crate::inbound::{InboundFilter, Verdict};
use crate::mailbox::{MailboxTransport, Subscription, TransportError};
use crate::session::{ExchangeFailure, ExchangeOutcome, SessionError, SessionManager};

/// Random bytes a new session needs: key pair plus session code with
/// headroom for rejected bytes.
const SESSION_RANDOM_BYTES: usize = PUBLIC_KEY_SIZE + 32;

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    /// Host waiting for a guest.
    Advertising,
    /// Guest joining.
    Connecting,
    Connected,
    /// Connected, but relay writes are being retried.
    Degraded,
    /// Relay writes failed after all retries. The session is still usable.
    Error,
}

impl ConnectionStatus {
    /// Payloads may be sent in these states.
    pub fn is_established(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connected | ConnectionStatus::Degraded | ConnectionStatus::Error
        )
    }
}

/// Coordinator-level view of the current pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: String,
    pub session_code: SessionCode,
    pub partner_public_key: Option<PublicKey>,
    pub status: ConnectionStatus,
    pub is_host: bool,
    pub created_at: u64,
    pub last_activity: u64,
    /// Six digits both users can compare to rule out a swapped key.
    pub verification_code: Option<String>,
}

/// What the host shows the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOffer {
    pub session_code: SessionCode,
    pub advertisement: SessionAdvertisement,
    /// QR code text.
    pub payload: String,
}

/// Error taxonomy for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No secure randomness; nothing cryptographic can proceed.
    Entropy,
    /// Bad or stale pairing data; the user can re-scan or regenerate.
    Protocol,
    /// Relay trouble; retry later.
    Transport,
    /// Operation not valid in the current lifecycle state.
    State,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("entropy unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("PRNG not ready: {0}")]
    PrngNotReady(String),

    #[error("invalid advertisement: {0}")]
    InvalidAdvertisement(AdvertisementError),

    #[error("expired advertisement: {0}")]
    ExpiredAdvertisement(AdvertisementError),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("key exchange failed: {0}")]
    ExchangeFailed(ExchangeFailure),

    #[error("not connected")]
    NotConnected,

    #[error("session expired")]
    SessionExpired,

    #[error("secure channel not ready")]
    ChannelNotReady,

    #[error("failed to publish advertisement: {0}")]
    AdvertisementPublishFailed(TransportError),

    #[error("relay error: {0}")]
    Transport(TransportError),

    #[error("session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("a session is already active")]
    AlreadyActive,

    #[error("cannot encode payload: {0}")]
    Payload(String),
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        use CoordinatorError::*;
        match self {
            EntropyUnavailable(_) | PrngNotReady(_) => ErrorKind::Entropy,
            InvalidAdvertisement(_)
            | ExpiredAdvertisement(_)
            | InvalidPublicKey(_)
            | SessionUnavailable(_) => ErrorKind::Protocol,
            AdvertisementPublishFailed(_) | Transport(_) => ErrorKind::Transport,
            ExchangeFailed(_) | NotConnected | SessionExpired | ChannelNotReady | AlreadyActive
            | Payload(_) => ErrorKind::State,
        }
    }

    /// Worth retrying the same call later without user action.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinatorError::AdvertisementPublishFailed(e) | CoordinatorError::Transport(e) => {
                e.is_retryable()
            }
            _ => false,
        }
    }

    /// Actionable text for the user.
    pub fn user_message(&self) -> String {
        use CoordinatorError::*;
        match self {
            EntropyUnavailable(_) | PrngNotReady(_) => {
                "This device could not generate secure keys. Restart the app and try again.".into()
            }
            InvalidAdvertisement(AdvertisementError::WrongApp(_)) => {
                "That QR code belongs to a different app.".into()
            }
            InvalidAdvertisement(AdvertisementError::UnsupportedVersion(_)) => {
                "Your partner is using a different version of the app. Update both devices.".into()
            }
            InvalidAdvertisement(_) => {
                "That code could not be read. Scan the QR code again or re-enter the code.".into()
            }
            ExpiredAdvertisement(_) => {
                "That QR code has expired. Ask your partner to show a fresh one.".into()
            }
            InvalidPublicKey(_) | ExchangeFailed(_) => {
                "Pairing failed. Ask your partner to start a new session and scan again.".into()
            }
            NotConnected | ChannelNotReady => "You are not connected to a partner.".into(),
            SessionExpired => "This session has expired. Start a new session.".into(),
            AdvertisementPublishFailed(_) | Transport(_) => {
                "Network problem. Check your connection and try again.".into()
            }
            SessionUnavailable(_) => {
                "No open session matches that code. Check the code or ask for a new one.".into()
            }
            AlreadyActive => "Disconnect from the current session first.".into(),
            Payload(_) => "That message could not be sent.".into(),
        }
    }
}

impl From<PrngError> for CoordinatorError {
    fn from(err: PrngError) -> Self {
        match err {
            PrngError::EntropyUnavailable(msg) => CoordinatorError::EntropyUnavailable(msg),
            other => CoordinatorError::PrngNotReady(other.to_string()),
        }
    }
}

impl From<SessionError> for CoordinatorError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::PrngNotReady(e) => e.into(),
            SessionError::AlreadyActive(_) => CoordinatorError::AlreadyActive,
            SessionError::ExchangeFailed(ExchangeFailure::Expired) | SessionError::Expired => {
                CoordinatorError::SessionExpired
            }
            SessionError::ExchangeFailed(f) => CoordinatorError::ExchangeFailed(f),
            SessionError::ChannelNotReady | SessionError::Format(_) => {
                CoordinatorError::ChannelNotReady
            }
        }
    }
}

impl From<AdvertisementError> for CoordinatorError {
    fn from(err: AdvertisementError) -> Self {
        match err {
            e if e.is_expired() => CoordinatorError::ExpiredAdvertisement(e),
            AdvertisementError::InvalidPublicKey(msg) => CoordinatorError::InvalidPublicKey(msg),
            e => CoordinatorError::InvalidAdvertisement(e),
        }
    }
}

// ============================================================================
// Internal state
// ============================================================================

/// Deferred side effect, run after the state lock is released.
enum Action {
    Emit(Event),
    SubscribeEnvelopes {
        code: String,
        since_ms: u64,
        generation: u64,
    },
    Release(Vec<Subscription>),
}

struct State {
    session: SessionManager,
    connection: Option<Connection>,
    generation: u64,
    record_sub: Option<Subscription>,
    envelope_sub: Option<Subscription>,
    inbound: Option<InboundFilter>,
}

impl State {
    fn status(&self) -> ConnectionStatus {
        self.connection
            .as_ref()
            .map(|c| c.status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Wipe the session and drop subscriptions. `reason` is reported to
    /// listeners when a connection existed.
    fn teardown(&mut self, reason: Option<DisconnectReason>) -> Vec<Action> {
        self.generation += 1;

        let subs: Vec<Subscription> = self
            .record_sub
            .take()
            .into_iter()
            .chain(self.envelope_sub.take())
            .collect();
        self.session.close();
        self.inbound = None;

        let mut actions = vec![Action::Release(subs)];
        if let Some(conn) = self.connection.take() {
            info!("connection {} ({}) torn down", conn.id, conn.session_code);
            if let Some(reason) = reason {
                actions.push(Action::Emit(Event::Disconnected(reason)));
            }
            actions.push(Action::Emit(Event::Status(ConnectionStatus::Disconnected)));
        }
        actions
    }

    fn set_status(&mut self, status: ConnectionStatus) -> Vec<Action> {
        match self.connection.as_mut() {
            Some(conn) if conn.status != status => {
                debug!("connection {}: {:?} -> {:?}", conn.id, conn.status, status);
                conn.status = status;
                vec![Action::Emit(Event::Status(status))]
            }
            _ => Vec::new(),
        }
    }
}

struct Inner<M, C, S> {
    mailbox: M,
    clock: C,
    config: ProtocolConfig,
    device_id: DeviceId,
    prng: tokio::sync::Mutex<CryptoPrng<S>>,
    state: Mutex<State>,
    events: EventHub,
}

impl<M, C, S> Inner<M, C, S>
where
    M: MailboxTransport,
    C: Clock,
    S: EntropySource + 'static,
{
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// False once the connection that `generation` belongs to was torn down.
    fn is_current(&self, generation: u64) -> bool {
        self.lock_state().generation == generation
    }

    /// Best-effort removal of a record written by an operation whose
    /// connection was torn down while it was in flight.
    async fn discard_record(&self, code: &str) {
        if let Err(e) = self.mailbox.delete_session_record(code).await {
            warn!("relay cleanup for session {} failed: {}", code, e);
        }
    }

    fn run(this: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Emit(event) => this.events.emit(&event),
                Action::SubscribeEnvelopes {
                    code,
                    since_ms,
                    generation,
                } => {
                    Self::subscribe_envelopes(this, &code, since_ms, generation);
                }
                Action::Release(subs) => drop(subs),
            }
        }
    }

    /// Returns false, keeping nothing, if `generation` is no longer current.
    fn subscribe_record(this: &Arc<Self>, code: &str, generation: u64) -> bool {
        let weak: Weak<Self> = Arc::downgrade(this);
        let sub = this.mailbox.subscribe_to_session_record(
            code,
            Box::new(move |record: Option<SessionRecord>| {
                if let Some(inner) = weak.upgrade() {
                    Self::on_record(&inner, generation, record);
                }
            }),
        );

        let mut state = this.lock_state();
        if state.generation == generation {
            state.record_sub = Some(sub);
            true
        } else {
            drop(state);
            drop(sub);
            false
        }
    }

    fn subscribe_envelopes(this: &Arc<Self>, code: &str, since_ms: u64, generation: u64) -> bool {
        let weak: Weak<Self> = Arc::downgrade(this);
        let sub = this.mailbox.subscribe_to_envelopes(
            code,
            since_ms,
            Box::new(move |envelope: EncryptedEnvelope| {
                if let Some(inner) = weak.upgrade() {
                    Self::on_envelope(&inner, generation, envelope);
                }
            }),
        );

        let mut state = this.lock_state();
        if state.generation != generation {
            drop(state);
            drop(sub);
            return false;
        }
        if state.envelope_sub.is_none() {
            state.envelope_sub = Some(sub);
        } else {
            drop(state);
            drop(sub);
        }
        true
    }

    fn on_record(this: &Arc<Self>, generation: u64, record: Option<SessionRecord>) {
        let now = this.clock.now_ms();
        let actions = {
            let mut state = this.lock_state();
            this.handle_record(&mut state, generation, record, now)
        };
        Self::run(this, actions);
    }

    fn on_envelope(this: &Arc<Self>, generation: u64, envelope: EncryptedEnvelope) {
        let now = this.clock.now_ms();
        let actions = {
            let mut state = this.lock_state();
            this.handle_envelope(&mut state, generation, envelope, now)
        };
        Self::run(this, actions);
    }

    fn handle_record(
        &self,
        state: &mut State,
        generation: u64,
        record: Option<SessionRecord>,
        now: u64,
    ) -> Vec<Action> {
        if state.generation != generation {
            return Vec::new();
        }
        let Some(conn) = state.connection.as_ref() else {
            return Vec::new();
        };

        let record = match record {
            None => {
                info!("session {} removed from relay", conn.session_code);
                return state.teardown(Some(DisconnectReason::Remote));
            }
            Some(r) if r.status == RecordStatus::Closed => {
                info!("session {} closed by peer", conn.session_code);
                return state.teardown(Some(DisconnectReason::Remote));
            }
            Some(r) => r,
        };

        if !conn.is_host {
            return Vec::new();
        }
        match record.guest_public_key {
            Some(guest_key) => self.accept_guest(state, &guest_key, now),
            None => Vec::new(),
        }
    }

    /// Host side: a guest key showed up in the session record.
    fn accept_guest(&self, state: &mut State, guest_key_b64: &str, now: u64) -> Vec<Action> {
        let guest_key = match PublicKey::from_base64(guest_key_b64) {
            Ok(key) => key,
            Err(e) => {
                warn!("ignoring guest key from relay: {}", e);
                return Vec::new();
            }
        };

        match state.session.complete_exchange(&guest_key, now) {
            Ok(ExchangeOutcome::Established) => {}
            Ok(ExchangeOutcome::AlreadyEstablished) => return Vec::new(),
            Err(SessionError::ExchangeFailed(ExchangeFailure::Expired)) => {
                return state.teardown(Some(DisconnectReason::Expired));
            }
            Err(e) => {
                warn!("rejected guest key {}: {}", guest_key.fingerprint(), e);
                return Vec::new();
            }
        }

        let verification_code = state.session.verification_code();
        let floor = self.inbound_floor(state);
        let Some(conn) = state.connection.as_mut() else {
            return Vec::new();
        };
        conn.partner_public_key = Some(guest_key);
        conn.last_activity = now;
        conn.verification_code = verification_code;
        let code = conn.session_code.to_string();

        state.inbound = Some(self.new_filter(floor));
        let mut actions = vec![Action::SubscribeEnvelopes {
            code,
            since_ms: floor,
            generation: state.generation,
        }];
        actions.extend(state.set_status(ConnectionStatus::Connected));
        if let Some(conn) = state.connection.as_ref() {
            info!("connection {} established as host", conn.id);
            actions.push(Action::Emit(Event::Connected(conn.clone())));
        }
        actions
    }

    fn handle_envelope(
        &self,
        state: &mut State,
        generation: u64,
        envelope: EncryptedEnvelope,
        now: u64,
    ) -> Vec<Action> {
        if state.generation != generation || !state.status().is_established() {
            return Vec::new();
        }
        let Some(filter) = state.inbound.as_ref() else {
            return Vec::new();
        };

        match filter.check(&envelope) {
            Verdict::Accept => {}
            verdict => {
                debug!("skipping envelope {}: {:?}", envelope.id, verdict);
                return Vec::new();
            }
        }

        let (ciphertext, nonce) = match (envelope.ciphertext_bytes(), envelope.nonce_bytes()) {
            (Ok(c), Ok(n)) => (c, n),
            _ => {
                warn!("dropping envelope {}: bad encoding", envelope.id);
                return Vec::new();
            }
        };

        let plaintext = match state
            .session
            .decrypt(&ciphertext, &nonce, &envelope.aad(), now)
        {
            Ok(Opened::Plaintext(p)) => p,
            Ok(Opened::Discarded) => {
                warn!("dropping envelope {}: authentication failed", envelope.id);
                return Vec::new();
            }
            Err(SessionError::Expired) => {
                return state.teardown(Some(DisconnectReason::Expired));
            }
            Err(e) => {
                warn!("dropping envelope {}: {}", envelope.id, e);
                return Vec::new();
            }
        };

        if let Some(filter) = state.inbound.as_mut() {
            filter.mark_processed(&envelope);
        }

        let payload = match Payload::from_bytes(&plaintext) {
            Ok(p) if p.kind() == envelope.kind => p,
            Ok(_) => {
                warn!("dropping envelope {}: kind mismatch", envelope.id);
                return Vec::new();
            }
            Err(e) => {
                warn!("dropping envelope {}: bad payload: {}", envelope.id, e);
                return Vec::new();
            }
        };

        if let Some(conn) = state.connection.as_mut() {
            conn.last_activity = now;
        }
        debug!("received {} envelope {}", envelope.kind.as_str(), envelope.id);

        vec![Action::Emit(Event::Payload(InboundMessage {
            envelope_id: envelope.id,
            sender_id: envelope.sender_id,
            timestamp: envelope.timestamp,
            payload,
        }))]
    }

    /// Envelopes at or before this time predate the connection. Allows for
    /// clock skew between the two devices.
    fn inbound_floor(&self, state: &State) -> u64 {
        let created = state
            .connection
            .as_ref()
            .map(|c| c.created_at)
            .unwrap_or(0);
        created.saturating_sub(self.config.max_clock_skew_ms())
    }

    fn new_filter(&self, floor: u64) -> InboundFilter {
        InboundFilter::new(
            self.device_id.clone(),
            floor,
            self.config.reorder_window_ms(),
            self.config.dedup_capacity,
        )
    }

    /// Run a relay operation with the configured backoff. `on_retry` is
    /// called before each retry and may return `false` to give up. With a
    /// `generation`, retries stop once that connection is torn down.
    async fn with_retry<T, F, Fut>(
        &self,
        what: &str,
        generation: Option<u64>,
        mut op: F,
        mut on_retry: impl FnMut(u32, &TransportError) -> bool,
    ) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let policy = self.config.send_retry;
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, policy.max_attempts, e, delay
                    );
                    if !on_retry(attempt, &e) {
                        return Err(e);
                    }
                    tokio::time::sleep(delay).await;
                    if generation.is_some_and(|g| !self.is_current(g)) {
                        debug!("{} abandoned: connection closed during backoff", what);
                        return Err(e);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    warn!("{} failed: {}", what, e);
                    return Err(e);
                }
            }
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Orchestrates session creation, pairing, messaging and teardown.
///
/// Cheap to clone; clones share the same connection.
pub struct ConnectionCoordinator<M, C = SystemClock, S = OsEntropy> {
    inner: Arc<Inner<M, C, S>>,
}

impl<M, C, S> Clone for ConnectionCoordinator<M, C, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: MailboxTransport> ConnectionCoordinator<M> {
    /// Coordinator on the system clock and OS entropy.
    pub fn new(mailbox: M, device_id: DeviceId, config: ProtocolConfig) -> Self {
        Self::from_parts(mailbox, device_id, config, SystemClock, CryptoPrng::new())
    }
}

impl<M, C, S> ConnectionCoordinator<M, C, S>
where
    M: MailboxTransport,
    C: Clock,
    S: EntropySource + 'static,
{
    pub fn from_parts(
        mailbox: M,
        device_id: DeviceId,
        config: ProtocolConfig,
        clock: C,
        prng: CryptoPrng<S>,
    ) -> Self {
        let session = SessionManager::new(config.session_ttl_ms());
        Self {
            inner: Arc::new(Inner {
                mailbox,
                clock,
                config,
                device_id,
                prng: tokio::sync::Mutex::new(prng),
                state: Mutex::new(State {
                    session,
                    connection: None,
                    generation: 0,
                    record_sub: None,
                    envelope_sub: None,
                    inbound: None,
                }),
                events: EventHub::default(),
            }),
        }
    }

    /// Listener registration.
    pub fn events(&self) -> &EventHub {
        &self.inner.events
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock_state().status()
    }

    pub fn connection(&self) -> Option<Connection> {
        self.inner.lock_state().connection.clone()
    }

    /// Fill the PRNG now so the first pairing does not wait on entropy.
    pub async fn warm_up(&self) -> Result<(), CoordinatorError> {
        self.inner.prng.lock().await.initialize().await?;
        Ok(())
    }

    /// Host: create a session, publish its record and start watching for a
    /// guest.
    pub async fn create_session(&self) -> Result<SessionOffer, CoordinatorError> {
        let inner = &self.inner;
        if inner.lock_state().connection.is_some() {
            return Err(CoordinatorError::AlreadyActive);
        }

        let mut prng = inner.prng.lock().await;
        prng.ensure(SESSION_RANDOM_BYTES).await?;
        let now = inner.clock.now_ms();

        let (offer, record, generation) = {
            let mut state = inner.lock_state();
            if state.connection.is_some() {
                return Err(CoordinatorError::AlreadyActive);
            }

            let code = state.session.create_session(&mut *prng, now)?;
            let host_key = state
                .session
                .local_public_key()
                .map(|k| k.to_base64())
                .ok_or(CoordinatorError::ChannelNotReady)?;

            state.generation += 1;
            state.connection = Some(Connection {
                id: new_connection_id(),
                session_code: code.clone(),
                partner_public_key: None,
                status: ConnectionStatus::Advertising,
                is_host: true,
                created_at: now,
                last_activity: now,
                verification_code: None,
            });

            let advertisement = SessionAdvertisement::new(&code, host_key.clone(), now);
            let offer = SessionOffer {
                session_code: code.clone(),
                payload: advertisement.to_payload(),
                advertisement,
            };
            let record = SessionRecord::waiting(&code, host_key, now);
            (offer, record, state.generation)
        };
        drop(prng);

        let code = offer.session_code.as_str();
        let published = inner
            .with_retry(
                "publish session record",
                Some(generation),
                || inner.mailbox.publish_session_record(code, record.clone()),
                |_, _| true,
            )
            .await;

        if let Err(e) = published {
            let actions = {
                let mut state = inner.lock_state();
                if state.generation == generation {
                    state.teardown(None)
                } else {
                    Vec::new()
                }
            };
            Inner::run(inner, actions);
            return Err(CoordinatorError::AdvertisementPublishFailed(e));
        }

        if !Inner::subscribe_record(inner, code, generation) {
            info!("session {} closed while its record was being published", code);
            inner.discard_record(code).await;
            return Err(CoordinatorError::NotConnected);
        }
        inner
            .events
            .emit(&Event::Status(ConnectionStatus::Advertising));
        info!("advertising session {}", code);
        Ok(offer)
    }

    /// Host: a freshly timestamped advertisement for the session being
    /// advertised, for when the previous QR code has gone stale.
    pub fn current_advertisement(&self) -> Option<SessionOffer> {
        let now = self.inner.clock.now_ms();
        let state = self.inner.lock_state();
        let conn = state.connection.as_ref()?;
        if !conn.is_host || conn.status != ConnectionStatus::Advertising {
            return None;
        }
        if state.session.is_expired(now) {
            return None;
        }

        let key = state.session.local_public_key()?.to_base64();
        let advertisement = SessionAdvertisement::new(&conn.session_code, key, now);
        Some(SessionOffer {
            session_code: conn.session_code.clone(),
            payload: advertisement.to_payload(),
            advertisement,
        })
    }

    /// Guest: join from a scanned QR payload.
    pub async fn connect_with_qr(&self, payload: &str) -> Result<Connection, CoordinatorError> {
        let now = self.inner.clock.now_ms();
        let ad = SessionAdvertisement::parse_and_validate(payload, now, &self.inner.config)
            .map_err(|e| {
                warn!("rejected advertisement: {}", e);
                CoordinatorError::from(e)
            })?;
        let code = ad.session_code()?;
        let host_key = PublicKey::from_base64(&ad.public_key)
            .map_err(|e| CoordinatorError::InvalidPublicKey(e.to_string()))?;

        self.join(code, host_key, None).await
    }

    /// Guest: join from a typed session code.
    ///
    /// The host key comes from the relay record, so this path trusts the
    /// relay for it. Compare the verification code with the host to detect
    /// a substituted key.
    pub async fn connect_with_code(&self, input: &str) -> Result<Connection, CoordinatorError> {
        let code = SessionCode::parse(input).map_err(|e| {
            CoordinatorError::InvalidAdvertisement(AdvertisementError::Malformed(e.to_string()))
        })?;
        if self.inner.lock_state().connection.is_some() {
            return Err(CoordinatorError::AlreadyActive);
        }

        let record = self.read_record(&code).await?;
        let host_key = PublicKey::from_base64(&record.host_public_key)
            .map_err(|e| CoordinatorError::InvalidPublicKey(e.to_string()))?;
        warn!(
            "joining {} by code: host key {} taken from relay",
            code,
            host_key.fingerprint()
        );

        self.join(code, host_key, Some(record)).await
    }

    async fn read_record(&self, code: &SessionCode) -> Result<SessionRecord, CoordinatorError> {
        let inner = &self.inner;
        inner
            .with_retry(
                "read session record",
                None,
                || inner.mailbox.read_session_record(code.as_str()),
                |_, _| true,
            )
            .await
            .map_err(CoordinatorError::Transport)?
            .ok_or_else(|| CoordinatorError::SessionUnavailable(format!("no session {code}")))
    }

    async fn join(
        &self,
        code: SessionCode,
        host_key: PublicKey,
        record: Option<SessionRecord>,
    ) -> Result<Connection, CoordinatorError> {
        let inner = &self.inner;
        if inner.lock_state().connection.is_some() {
            return Err(CoordinatorError::AlreadyActive);
        }

        let record = match record {
            Some(r) => r,
            None => self.read_record(&code).await?,
        };
        if record.status == RecordStatus::Closed {
            return Err(CoordinatorError::SessionUnavailable(format!(
                "session {code} is closed"
            )));
        }
        if record.guest_public_key.is_some() {
            return Err(CoordinatorError::SessionUnavailable(format!(
                "session {code} already has a guest"
            )));
        }
        if record.host_public_key != host_key.to_base64() {
            return Err(CoordinatorError::InvalidPublicKey(
                "advertised key does not match the relay session".into(),
            ));
        }

        let mut prng = inner.prng.lock().await;
        prng.ensure(PUBLIC_KEY_SIZE).await?;
        let now = inner.clock.now_ms();

        let (guest_key, generation) = {
            let mut state = inner.lock_state();
            if state.connection.is_some() {
                return Err(CoordinatorError::AlreadyActive);
            }

            let guest_key = state.session.join_session(code.clone(), &mut *prng, now)?;
            if let Err(e) = state.session.complete_exchange(&host_key, now) {
                state.session.close();
                return Err(e.into());
            }

            state.generation += 1;
            state.connection = Some(Connection {
                id: new_connection_id(),
                session_code: code.clone(),
                partner_public_key: Some(host_key),
                status: ConnectionStatus::Connecting,
                is_host: false,
                created_at: now,
                last_activity: now,
                verification_code: state.session.verification_code(),
            });
            (guest_key, state.generation)
        };
        drop(prng);
        inner
            .events
            .emit(&Event::Status(ConnectionStatus::Connecting));

        let update = SessionRecordUpdate::guest_joined(guest_key.to_base64(), now);
        let published = inner
            .with_retry(
                "publish guest key",
                Some(generation),
                || {
                    inner
                        .mailbox
                        .update_session_record(code.as_str(), update.clone())
                },
                |_, _| true,
            )
            .await;

        if let Err(e) = published {
            let actions = {
                let mut state = inner.lock_state();
                if state.generation == generation {
                    state.teardown(None)
                } else {
                    Vec::new()
                }
            };
            Inner::run(inner, actions);
            return Err(match e {
                TransportError::NotFound(_) => {
                    CoordinatorError::SessionUnavailable(format!("session {code} disappeared"))
                }
                e => CoordinatorError::Transport(e),
            });
        }

        let prepared = {
            let mut state = inner.lock_state();
            if state.generation == generation && state.connection.is_some() {
                let floor = inner.inbound_floor(&state);
                state.inbound = Some(inner.new_filter(floor));
                let actions = state.set_status(ConnectionStatus::Connected);
                state
                    .connection
                    .clone()
                    .map(|connection| (connection, floor, actions))
            } else {
                None
            }
        };
        let subscribed = match &prepared {
            Some((_, floor, _)) => {
                Inner::subscribe_envelopes(inner, code.as_str(), *floor, generation)
                    && Inner::subscribe_record(inner, code.as_str(), generation)
            }
            None => false,
        };
        let Some((connection, _, mut actions)) = prepared.filter(|_| subscribed) else {
            info!("session {} closed while joining", code);
            inner.discard_record(code.as_str()).await;
            return Err(CoordinatorError::NotConnected);
        };

        info!("connection {} established as guest", connection.id);
        actions.push(Action::Emit(Event::Connected(connection.clone())));
        Inner::run(inner, actions);
        Ok(connection)
    }

    /// Host: poll the relay for a guest instead of waiting for the
    /// subscription. Returns whether the connection is established.
    pub async fn check_for_connection(&self) -> Result<bool, CoordinatorError> {
        let inner = &self.inner;
        let (code, generation) = {
            let state = inner.lock_state();
            let conn = state
                .connection
                .as_ref()
                .ok_or(CoordinatorError::NotConnected)?;
            if conn.status.is_established() {
                return Ok(true);
            }
            if !conn.is_host {
                return Ok(false);
            }
            (conn.session_code.to_string(), state.generation)
        };

        let record = inner
            .with_retry(
                "read session record",
                Some(generation),
                || inner.mailbox.read_session_record(&code),
                |_, _| true,
            )
            .await
            .map_err(CoordinatorError::Transport)?;

        Inner::on_record(inner, generation, record);
        Ok(self.status().is_established())
    }

    /// Encrypt and publish a payload. Returns the envelope id.
    pub async fn send_payload(&self, payload: Payload) -> Result<String, CoordinatorError> {
        let inner = &self.inner;
        let plaintext = Zeroizing::new(
            payload
                .to_bytes()
                .map_err(|e| CoordinatorError::Payload(e.to_string()))?,
        );

        let mut prng = inner.prng.lock().await;
        prng.ensure(NONCE_SIZE).await?;
        let now = inner.clock.now_ms();

        let prepared = {
            let mut state = inner.lock_state();
            if !state.status().is_established() {
                Err((CoordinatorError::NotConnected, Vec::new()))
            } else if state.session.is_expired(now) {
                let actions = state.teardown(Some(DisconnectReason::Expired));
                Err((CoordinatorError::SessionExpired, actions))
            } else {
                let id = EncryptedEnvelope::new_id();
                let kind = payload.kind();
                let aad = EncryptedEnvelope::associated_data(&id, kind, inner.device_id.as_str());
                match state.session.encrypt(&plaintext, &aad, &mut *prng, now) {
                    Ok(sealed) => {
                        let code = state
                            .session
                            .code()
                            .map(|c| c.to_string())
                            .unwrap_or_default();
                        let envelope = EncryptedEnvelope {
                            id,
                            sender_id: inner.device_id.to_string(),
                            ciphertext: STANDARD.encode(&sealed.ciphertext),
                            nonce: STANDARD.encode(sealed.nonce),
                            timestamp: now,
                            kind,
                            metadata: payload.metadata(),
                        };
                        Ok((code, envelope, state.generation))
                    }
                    Err(e) => Err((e.into(), Vec::new())),
                }
            }
        };
        drop(prng);

        let (code, envelope, generation) = match prepared {
            Ok(p) => p,
            Err((e, actions)) => {
                Inner::run(inner, actions);
                return Err(e);
            }
        };
        let envelope_id = envelope.id.clone();

        let published = inner
            .with_retry(
                "publish envelope",
                Some(generation),
                || inner.mailbox.publish_envelope(&code, envelope.clone()),
                |attempt, _| {
                    let (alive, actions) = {
                        let mut state = inner.lock_state();
                        if state.generation != generation {
                            (false, Vec::new())
                        } else if attempt == 1 {
                            (true, state.set_status(ConnectionStatus::Degraded))
                        } else {
                            (true, Vec::new())
                        }
                    };
                    Inner::run(inner, actions);
                    alive
                },
            )
            .await;

        let (result, actions) = {
            let mut state = inner.lock_state();
            if state.generation != generation {
                (Err(CoordinatorError::NotConnected), Vec::new())
            } else {
                match published {
                    Ok(()) => {
                        if let Some(conn) = state.connection.as_mut() {
                            conn.last_activity = inner.clock.now_ms();
                        }
                        debug!("sent {} envelope {}", envelope.kind.as_str(), envelope_id);
                        (
                            Ok(envelope_id),
                            state.set_status(ConnectionStatus::Connected),
                        )
                    }
                    Err(e) => (
                        Err(CoordinatorError::Transport(e)),
                        state.set_status(ConnectionStatus::Error),
                    ),
                }
            }
        };
        Inner::run(inner, actions);
        result
    }

    /// Tear down the current session if it has outlived its lifetime.
    /// Returns whether it did.
    pub fn check_expiry(&self) -> bool {
        let now = self.inner.clock.now_ms();
        let actions = {
            let mut state = self.inner.lock_state();
            if state.connection.is_none() || !state.session.is_expired(now) {
                return false;
            }
            state.teardown(Some(DisconnectReason::Expired))
        };
        Inner::run(&self.inner, actions);
        true
    }

    /// Unsubscribe, wipe key material and ask the relay to drop the session.
    ///
    /// Always succeeds locally; relay cleanup is best-effort.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let (code, actions) = {
            let mut state = inner.lock_state();
            let code = state.session.code().cloned();
            (code, state.teardown(Some(DisconnectReason::Local)))
        };
        Inner::run(inner, actions);

        if let Some(code) = code {
            inner.discard_record(code.as_str()).await;
        }
    }
}

fn new_connection_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            CoordinatorError::EntropyUnavailable("x".into()).kind(),
            ErrorKind::Entropy
        );
        assert_eq!(
            CoordinatorError::ExpiredAdvertisement(AdvertisementError::Stale { age_secs: 600 })
                .kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            CoordinatorError::Transport(TransportError::Unavailable("x".into())).kind(),
            ErrorKind::Transport
        );
        assert_eq!(CoordinatorError::NotConnected.kind(), ErrorKind::State);
    }

    #[test]
    fn test_only_transient_relay_errors_are_retryable() {
        assert!(CoordinatorError::AdvertisementPublishFailed(TransportError::Unavailable(
            "x".into()
        ))
        .is_retryable());
        assert!(!CoordinatorError::Transport(TransportError::Rejected("x".into())).is_retryable());
        assert!(!CoordinatorError::SessionExpired.is_retryable());
    }

    #[test]
    fn test_advertisement_errors_map_distinctly() {
        let stale: CoordinatorError = AdvertisementError::Stale { age_secs: 600 }.into();
        assert!(matches!(stale, CoordinatorError::ExpiredAdvertisement(_)));

        let wrong: CoordinatorError = AdvertisementError::WrongApp("other".into()).into();
        assert!(matches!(wrong, CoordinatorError::InvalidAdvertisement(_)));
        assert!(wrong.user_message().contains("different app"));

        let key: CoordinatorError = AdvertisementError::InvalidPublicKey("short".into()).into();
        assert!(matches!(key, CoordinatorError::InvalidPublicKey(_)));
    }

    #[test]
    fn test_user_messages_differ_by_cause() {
        let stale = CoordinatorError::ExpiredAdvertisement(AdvertisementError::Stale {
            age_secs: 600,
        });
        let network = CoordinatorError::Transport(TransportError::Unavailable("x".into()));
        assert_ne!(stale.user_message(), network.user_message());
        assert!(stale.user_message().contains("expired"));
    }
}
