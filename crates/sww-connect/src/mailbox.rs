//! Relay mailbox contract.
//!
//! The relay is untrusted: it stores one [`SessionRecord`] and an append-only
//! list of [`EncryptedEnvelope`]s per session id and pushes changes to
//! subscribers. Delivery is at-least-once. Nothing stored here is readable
//! without the session secret.
//!
//! [`MemoryMailbox`] is an in-process relay for tests, demos and local
//! pairing. It can inject write failures, rewrite envelopes in flight and
//! redeliver the whole envelope list on every change the way realtime
//! document stores do.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use thiserror::Error;

use sww_common::{EncryptedEnvelope, SessionRecord, SessionRecordUpdate};

/// Relay errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Network or relay outage; worth retrying
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("session record not found: {0}")]
    NotFound(String),

    /// Relay refused the write; retrying will not help
    #[error("relay rejected write: {0}")]
    Rejected(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }
}

/// Called with the current record on every change; `None` once deleted.
pub type RecordCallback = Box<dyn Fn(Option<SessionRecord>) + Send + Sync>;

/// Called once per delivered envelope. May be called again for the same one.
pub type EnvelopeCallback = Box<dyn Fn(EncryptedEnvelope) + Send + Sync>;

/// Handle for an active subscription. Cancels on drop.
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// What the core needs from a relay.
///
/// Session ids are the only partition key. Subscription callbacks may run
/// synchronously inside `subscribe_*` or inside a write on another handle,
/// so callers must not hold locks the callback needs when calling them.
#[async_trait]
pub trait MailboxTransport: Send + Sync + 'static {
    async fn publish_session_record(
        &self,
        session_id: &str,
        record: SessionRecord,
    ) -> Result<(), TransportError>;

    async fn read_session_record(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, TransportError>;

    /// Merge `update` into an existing record. `NotFound` if there is none.
    async fn update_session_record(
        &self,
        session_id: &str,
        update: SessionRecordUpdate,
    ) -> Result<(), TransportError>;

    /// Remove the record and every envelope stored under it.
    async fn delete_session_record(&self, session_id: &str) -> Result<(), TransportError>;

    async fn publish_envelope(
        &self,
        session_id: &str,
        envelope: EncryptedEnvelope,
    ) -> Result<(), TransportError>;

    fn subscribe_to_session_record(&self, session_id: &str, callback: RecordCallback)
        -> Subscription;

    /// Deliver envelopes with `timestamp > since_ms`, existing ones first.
    fn subscribe_to_envelopes(
        &self,
        session_id: &str,
        since_ms: u64,
        callback: EnvelopeCallback,
    ) -> Subscription;
}

// ============================================================================
// In-memory relay
// ============================================================================

type Interceptor = Arc<dyn Fn(&mut EncryptedEnvelope) + Send + Sync>;

struct RecordSub {
    session_id: String,
    callback: Arc<RecordCallback>,
}

struct EnvelopeSub {
    session_id: String,
    since_ms: u64,
    callback: Arc<EnvelopeCallback>,
}

#[derive(Default)]
struct MailboxState {
    records: HashMap<String, SessionRecord>,
    envelopes: HashMap<String, Vec<EncryptedEnvelope>>,
    record_subs: HashMap<u64, RecordSub>,
    envelope_subs: HashMap<u64, EnvelopeSub>,
    next_sub_id: u64,
    failing_writes: u32,
    offline: bool,
    full_redelivery: bool,
    interceptor: Option<Interceptor>,
}

impl MailboxState {
    fn next_id(&mut self) -> u64 {
        self.next_sub_id += 1;
        self.next_sub_id
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.offline {
            return Err(TransportError::Unavailable("relay offline".into()));
        }
        Ok(())
    }

    fn check_write(&mut self) -> Result<(), TransportError> {
        self.check_online()?;
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(TransportError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    fn record_listeners(&self, session_id: &str) -> Vec<Arc<RecordCallback>> {
        let mut subs: Vec<_> = self
            .record_subs
            .iter()
            .filter(|(_, s)| s.session_id == session_id)
            .collect();
        subs.sort_by_key(|(id, _)| **id);
        subs.into_iter().map(|(_, s)| s.callback.clone()).collect()
    }
}

/// In-process relay shared by every clone.
#[derive(Clone, Default)]
pub struct MemoryMailbox {
    state: Arc<Mutex<MailboxState>>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `n` writes with a retryable error.
    pub fn fail_next_writes(&self, n: u32) {
        self.lock().failing_writes = n;
    }

    /// Every operation fails with `Unavailable` while offline.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Redeliver every stored envelope to every subscriber on each new one.
    pub fn set_full_redelivery(&self, enabled: bool) {
        self.lock().full_redelivery = enabled;
    }

    /// Rewrite envelopes as they are stored, like a hostile relay would.
    pub fn intercept_envelopes(&self, f: impl Fn(&mut EncryptedEnvelope) + Send + Sync + 'static) {
        self.lock().interceptor = Some(Arc::new(f));
    }

    pub fn clear_interceptor(&self) {
        self.lock().interceptor = None;
    }

    pub fn record(&self, session_id: &str) -> Option<SessionRecord> {
        self.lock().records.get(session_id).cloned()
    }

    pub fn envelopes(&self, session_id: &str) -> Vec<EncryptedEnvelope> {
        self.lock()
            .envelopes
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Active record and envelope subscriptions for `session_id`.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        let state = self.lock();
        state
            .record_subs
            .values()
            .filter(|s| s.session_id == session_id)
            .count()
            + state
                .envelope_subs
                .values()
                .filter(|s| s.session_id == session_id)
                .count()
    }

    /// Replay an envelope to subscribers without storing it.
    pub fn redeliver(&self, session_id: &str, envelope: EncryptedEnvelope) {
        let listeners = self.envelope_listeners(session_id, envelope.timestamp);
        for callback in listeners {
            callback(envelope.clone());
        }
    }

    fn envelope_listeners(&self, session_id: &str, timestamp: u64) -> Vec<Arc<EnvelopeCallback>> {
        let state = self.lock();
        let mut subs: Vec<_> = state
            .envelope_subs
            .iter()
            .filter(|(_, s)| s.session_id == session_id && timestamp > s.since_ms)
            .collect();
        subs.sort_by_key(|(id, _)| **id);
        subs.into_iter().map(|(_, s)| s.callback.clone()).collect()
    }

    fn notify_record(&self, session_id: &str) {
        let (listeners, record) = {
            let state = self.lock();
            (
                state.record_listeners(session_id),
                state.records.get(session_id).cloned(),
            )
        };
        for callback in listeners {
            callback(record.clone());
        }
    }
}

#[async_trait]
impl MailboxTransport for MemoryMailbox {
    async fn publish_session_record(
        &self,
        session_id: &str,
        record: SessionRecord,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.lock();
            state.check_write()?;
            state.records.insert(session_id.to_string(), record);
        }
        self.notify_record(session_id);
        Ok(())
    }

    async fn read_session_record(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, TransportError> {
        let state = self.lock();
        state.check_online()?;
        Ok(state.records.get(session_id).cloned())
    }

    async fn update_session_record(
        &self,
        session_id: &str,
        update: SessionRecordUpdate,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.lock();
            state.check_write()?;
            let record = state
                .records
                .get_mut(session_id)
                .ok_or_else(|| TransportError::NotFound(session_id.to_string()))?;
            record.apply(&update);
        }
        self.notify_record(session_id);
        Ok(())
    }

    async fn delete_session_record(&self, session_id: &str) -> Result<(), TransportError> {
        let existed = {
            let mut state = self.lock();
            state.check_online()?;
            state.envelopes.remove(session_id);
            state.records.remove(session_id).is_some()
        };
        if existed {
            self.notify_record(session_id);
        }
        Ok(())
    }

    async fn publish_envelope(
        &self,
        session_id: &str,
        mut envelope: EncryptedEnvelope,
    ) -> Result<(), TransportError> {
        let (listeners, deliveries) = {
            let mut state = self.lock();
            state.check_write()?;

            if let Some(interceptor) = state.interceptor.clone() {
                interceptor(&mut envelope);
            }

            let stored = state.envelopes.entry(session_id.to_string()).or_default();
            stored.push(envelope.clone());
            let deliveries = if state.full_redelivery {
                state
                    .envelopes
                    .get(session_id)
                    .cloned()
                    .unwrap_or_default()
            } else {
                vec![envelope]
            };

            let mut subs: Vec<_> = state
                .envelope_subs
                .iter()
                .filter(|(_, s)| s.session_id == session_id)
                .map(|(id, s)| (*id, s.since_ms, s.callback.clone()))
                .collect();
            subs.sort_by_key(|(id, _, _)| *id);
            (subs, deliveries)
        };

        for (_, since_ms, callback) in listeners {
            for envelope in deliveries.iter().filter(|e| e.timestamp > since_ms) {
                callback(envelope.clone());
            }
        }
        Ok(())
    }

    fn subscribe_to_session_record(
        &self,
        session_id: &str,
        callback: RecordCallback,
    ) -> Subscription {
        let callback = Arc::new(callback);
        let (id, current) = {
            let mut state = self.lock();
            let id = state.next_id();
            state.record_subs.insert(
                id,
                RecordSub {
                    session_id: session_id.to_string(),
                    callback: callback.clone(),
                },
            );
            (id, state.records.get(session_id).cloned())
        };

        callback(current);
        self.cancel_handle(id, |state, id| {
            state.record_subs.remove(&id);
        })
    }

    fn subscribe_to_envelopes(
        &self,
        session_id: &str,
        since_ms: u64,
        callback: EnvelopeCallback,
    ) -> Subscription {
        let callback = Arc::new(callback);
        let (id, backlog) = {
            let mut state = self.lock();
            let id = state.next_id();
            state.envelope_subs.insert(
                id,
                EnvelopeSub {
                    session_id: session_id.to_string(),
                    since_ms,
                    callback: callback.clone(),
                },
            );
            let backlog: Vec<_> = state
                .envelopes
                .get(session_id)
                .map(|list| {
                    list.iter()
                        .filter(|e| e.timestamp > since_ms)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            (id, backlog)
        };

        for envelope in backlog {
            callback(envelope);
        }
        self.cancel_handle(id, |state, id| {
            state.envelope_subs.remove(&id);
        })
    }
}

impl MemoryMailbox {
    fn cancel_handle(
        &self,
        id: u64,
        remove: impl FnOnce(&mut MailboxState, u64) + Send + Sync + 'static,
    ) -> Subscription {
        let weak: Weak<Mutex<MailboxState>> = Arc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
                remove(&mut guard, id);
            }
        })
    }
}

impl fmt::Debug for MemoryMailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryMailbox")
            .field("sessions", &state.records.len())
            .field("record_subs", &state.record_subs.len())
            .field("envelope_subs", &state.envelope_subs.len())
            .finish()
    }
}
