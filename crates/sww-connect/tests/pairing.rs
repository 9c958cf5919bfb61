//! End-to-end pairing and messaging through the in-memory relay.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};

use tokio::sync::Notify;

use sww_common::{
    DeviceId, EncryptedEnvelope, Payload, PayloadKind, ProtocolConfig, RecordStatus,
    SessionCode, SessionRecord, SessionRecordUpdate, SignalPayload,
};
use sww_connect::{
    ConnectionCoordinator, ConnectionStatus, CoordinatorError, DisconnectReason,
    EnvelopeCallback, ErrorKind, InboundMessage, ListenerHandle, MailboxTransport, ManualClock,
    MemoryMailbox, RecordCallback, Subscription, TransportError,
};
use sww_crypto::{CryptoPrng, EntropySource, OsEntropy, PrngError};

const START_MS: u64 = 1_700_000_000_000;

type Device = ConnectionCoordinator<MemoryMailbox, ManualClock, OsEntropy>;

fn device(relay: &MemoryMailbox, clock: &ManualClock, config: ProtocolConfig) -> Device {
    ConnectionCoordinator::from_parts(
        relay.clone(),
        DeviceId::generate().unwrap(),
        config,
        clock.clone(),
        CryptoPrng::new(),
    )
}

#[derive(Clone, Default)]
struct Recorder {
    payloads: Arc<Mutex<Vec<InboundMessage>>>,
    statuses: Arc<Mutex<Vec<ConnectionStatus>>>,
    disconnects: Arc<Mutex<Vec<DisconnectReason>>>,
    connects: Arc<Mutex<usize>>,
    handles: Arc<Mutex<Vec<ListenerHandle>>>,
}

impl Recorder {
    fn attach<M, C, S>(coordinator: &ConnectionCoordinator<M, C, S>) -> Self
    where
        M: MailboxTransport,
        C: sww_connect::Clock,
        S: EntropySource + 'static,
    {
        let rec = Recorder::default();
        let events = coordinator.events();

        let mut handles = rec.handles.lock().unwrap();
        let sink = rec.payloads.clone();
        handles.push(events.on_payload(move |m| sink.lock().unwrap().push(m.clone())));
        let sink = rec.statuses.clone();
        handles.push(events.on_status(move |s| sink.lock().unwrap().push(*s)));
        let sink = rec.disconnects.clone();
        handles.push(events.on_disconnected(move |r| sink.lock().unwrap().push(r.clone())));
        let sink = rec.connects.clone();
        handles.push(events.on_connected(move |_| *sink.lock().unwrap() += 1));
        drop(handles);
        rec
    }

    fn payloads(&self) -> Vec<Payload> {
        self.payloads
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.payload.clone())
            .collect()
    }

    fn statuses(&self) -> Vec<ConnectionStatus> {
        self.statuses.lock().unwrap().clone()
    }

    fn disconnects(&self) -> Vec<DisconnectReason> {
        self.disconnects.lock().unwrap().clone()
    }
}

struct Pair {
    relay: MemoryMailbox,
    clock: ManualClock,
    host: Device,
    guest: Device,
    host_events: Recorder,
    guest_events: Recorder,
    code: SessionCode,
}

async fn paired(config: ProtocolConfig) -> Pair {
    let relay = MemoryMailbox::new();
    let clock = ManualClock::new(START_MS);
    let host = device(&relay, &clock, config.clone());
    let guest = device(&relay, &clock, config);
    let host_events = Recorder::attach(&host);
    let guest_events = Recorder::attach(&guest);

    let offer = host.create_session().await.unwrap();
    guest.connect_with_qr(&offer.payload).await.unwrap();

    Pair {
        relay,
        clock,
        host,
        guest,
        host_events,
        guest_events,
        code: offer.session_code,
    }
}

fn thumbs_up() -> Payload {
    Payload::Signal(SignalPayload::icon("yes", "👍", "Yes"))
}

#[tokio::test]
async fn test_signal_delivered_exactly_once() {
    let pair = paired(ProtocolConfig::default()).await;

    assert_eq!(pair.host.status(), ConnectionStatus::Connected);
    assert_eq!(pair.guest.status(), ConnectionStatus::Connected);
    assert_eq!(
        pair.host_events.statuses(),
        vec![ConnectionStatus::Advertising, ConnectionStatus::Connected]
    );
    assert_eq!(
        pair.guest_events.statuses(),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
    );
    assert_eq!(*pair.host_events.connects.lock().unwrap(), 1);
    assert_eq!(*pair.guest_events.connects.lock().unwrap(), 1);

    pair.host.send_payload(thumbs_up()).await.unwrap();

    assert_eq!(pair.guest_events.payloads(), vec![thumbs_up()]);
    // The host's own envelope echoes back to it and is skipped.
    assert!(pair.host_events.payloads().is_empty());

    let stored = pair.relay.envelopes(pair.code.as_str());
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].kind, PayloadKind::Signal);
    assert!(!stored[0].ciphertext.contains("Yes"));
}

#[tokio::test]
async fn test_both_directions_and_all_kinds() {
    let pair = paired(ProtocolConfig::default()).await;

    pair.guest
        .send_payload(Payload::text("on my way"))
        .await
        .unwrap();
    let image = Payload::Image(sww_common::Attachment::new("p.png", "image/png", &[1, 2, 3]));
    pair.guest.send_payload(image.clone()).await.unwrap();

    assert_eq!(
        pair.host_events.payloads(),
        vec![Payload::text("on my way"), image]
    );

    let stored = pair.relay.envelopes(pair.code.as_str());
    let meta = stored[1].metadata.clone().unwrap();
    assert_eq!(meta.mime_type.as_deref(), Some("image/png"));
    assert_eq!(meta.file_size, Some(3));
}

#[tokio::test]
async fn test_verification_codes_match() {
    let pair = paired(ProtocolConfig::default()).await;

    let host_code = pair.host.connection().unwrap().verification_code.unwrap();
    let guest_code = pair.guest.connection().unwrap().verification_code.unwrap();
    assert_eq!(host_code, guest_code);
    assert_eq!(host_code.len(), 6);
}

#[tokio::test]
async fn test_tampered_ciphertext_is_dropped() {
    let pair = paired(ProtocolConfig::default()).await;

    pair.relay.intercept_envelopes(|envelope| {
        let mut bytes = STANDARD.decode(&envelope.ciphertext).unwrap();
        bytes[0] ^= 0x01;
        envelope.ciphertext = STANDARD.encode(bytes);
    });
    pair.host.send_payload(thumbs_up()).await.unwrap();

    assert!(pair.guest_events.payloads().is_empty());
    assert_eq!(pair.guest.status(), ConnectionStatus::Connected);

    pair.relay.clear_interceptor();
    pair.host.send_payload(thumbs_up()).await.unwrap();
    assert_eq!(pair.guest_events.payloads(), vec![thumbs_up()]);
}

#[tokio::test]
async fn test_relabelled_envelope_is_dropped() {
    let pair = paired(ProtocolConfig::default()).await;

    pair.relay
        .intercept_envelopes(|envelope| envelope.kind = PayloadKind::Text);
    pair.host.send_payload(thumbs_up()).await.unwrap();

    assert!(pair.guest_events.payloads().is_empty());
    assert_eq!(pair.guest.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_redelivery_is_deduplicated() {
    let pair = paired(ProtocolConfig::default()).await;
    pair.relay.set_full_redelivery(true);

    for body in ["one", "two", "three"] {
        pair.clock.advance(Duration::from_millis(10));
        pair.host.send_payload(Payload::text(body)).await.unwrap();
    }

    let first = pair.relay.envelopes(pair.code.as_str())[0].clone();
    pair.relay.redeliver(pair.code.as_str(), first);

    assert_eq!(
        pair.guest_events.payloads(),
        vec![
            Payload::text("one"),
            Payload::text("two"),
            Payload::text("three")
        ]
    );
}

#[tokio::test]
async fn test_expired_advertisement_is_rejected_without_state_change() {
    let relay = MemoryMailbox::new();
    let clock = ManualClock::new(START_MS);
    let host = device(&relay, &clock, ProtocolConfig::default());
    let guest = device(&relay, &clock, ProtocolConfig::default());

    let offer = host.create_session().await.unwrap();
    clock.advance(Duration::from_secs(10 * 60));

    let err = guest.connect_with_qr(&offer.payload).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::ExpiredAdvertisement(_)));
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(guest.status(), ConnectionStatus::Disconnected);
    assert_eq!(host.status(), ConnectionStatus::Advertising);

    // A refreshed advertisement for the same session still works.
    let fresh = host.current_advertisement().unwrap();
    assert_eq!(fresh.session_code, offer.session_code);
    guest.connect_with_qr(&fresh.payload).await.unwrap();
    assert_eq!(host.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_foreign_qr_code_is_rejected() {
    let relay = MemoryMailbox::new();
    let clock = ManualClock::new(START_MS);
    let host = device(&relay, &clock, ProtocolConfig::default());
    let guest = device(&relay, &clock, ProtocolConfig::default());

    let offer = host.create_session().await.unwrap();
    let mut value: serde_json::Value = serde_json::from_str(&offer.payload).unwrap();
    value["app"] = serde_json::Value::String("someone-else".into());

    let err = guest
        .connect_with_qr(&value.to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidAdvertisement(_)));
    assert!(err.user_message().contains("different app"));

    let err = guest.connect_with_qr("not json").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidAdvertisement(_)));
    assert_eq!(guest.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_join_by_typed_code() {
    let relay = MemoryMailbox::new();
    let clock = ManualClock::new(START_MS);
    let host = device(&relay, &clock, ProtocolConfig::default());
    let guest = device(&relay, &clock, ProtocolConfig::default());
    let guest_events = Recorder::attach(&guest);

    let offer = host.create_session().await.unwrap();
    let typed = offer.session_code.as_str().to_lowercase();
    let connection = guest.connect_with_code(&typed).await.unwrap();

    assert!(!connection.is_host);
    assert_eq!(connection.session_code, offer.session_code);
    assert_eq!(host.status(), ConnectionStatus::Connected);

    host.send_payload(Payload::text("hi")).await.unwrap();
    assert_eq!(guest_events.payloads(), vec![Payload::text("hi")]);
}

#[tokio::test]
async fn test_unknown_code_is_unavailable() {
    let relay = MemoryMailbox::new();
    let clock = ManualClock::new(START_MS);
    let guest = device(&relay, &clock, ProtocolConfig::default());

    let err = guest.connect_with_code("ZZZZZZ").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::SessionUnavailable(_)));

    let err = guest.connect_with_code("abc").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidAdvertisement(_)));
}

#[tokio::test]
async fn test_session_with_guest_cannot_be_joined_again() {
    let pair = paired(ProtocolConfig::default()).await;
    let intruder = device(&pair.relay, &pair.clock, ProtocolConfig::default());

    let err = intruder
        .connect_with_code(pair.code.as_str())
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::SessionUnavailable(_)));
    assert_eq!(pair.host.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_second_session_requires_disconnect() {
    let pair = paired(ProtocolConfig::default()).await;

    let err = pair.host.create_session().await.unwrap_err();
    assert!(matches!(err, CoordinatorError::AlreadyActive));

    pair.host.disconnect().await;
    assert!(pair.host.create_session().await.is_ok());
}

#[tokio::test]
async fn test_check_for_connection_polls_relay() {
    let relay = MemoryMailbox::new();
    let clock = ManualClock::new(START_MS);
    let host = device(&relay, &clock, ProtocolConfig::default());
    let guest = device(&relay, &clock, ProtocolConfig::default());

    assert!(matches!(
        host.check_for_connection().await,
        Err(CoordinatorError::NotConnected)
    ));

    let offer = host.create_session().await.unwrap();
    assert!(!host.check_for_connection().await.unwrap());

    guest.connect_with_qr(&offer.payload).await.unwrap();
    assert!(host.check_for_connection().await.unwrap());
}

#[tokio::test]
async fn test_local_disconnect_cleans_up_both_sides() {
    let pair = paired(ProtocolConfig::default()).await;
    assert_eq!(pair.relay.subscriber_count(pair.code.as_str()), 4);

    pair.host.disconnect().await;

    assert_eq!(pair.host.status(), ConnectionStatus::Disconnected);
    assert_eq!(pair.host_events.disconnects(), vec![DisconnectReason::Local]);
    assert_eq!(pair.guest.status(), ConnectionStatus::Disconnected);
    assert_eq!(pair.guest_events.disconnects(), vec![DisconnectReason::Remote]);
    assert!(pair.relay.record(pair.code.as_str()).is_none());
    assert_eq!(pair.relay.subscriber_count(pair.code.as_str()), 0);

    let err = pair.host.send_payload(thumbs_up()).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NotConnected));

    // Nothing reaches either side after teardown.
    pair.relay
        .publish_envelope(
            pair.code.as_str(),
            EncryptedEnvelope {
                id: "late".into(),
                sender_id: "0011223344556677".into(),
                ciphertext: "AAAA".into(),
                nonce: "AAAA".into(),
                timestamp: START_MS + 1,
                kind: PayloadKind::Text,
                metadata: None,
            },
        )
        .await
        .unwrap();
    assert!(pair.guest_events.payloads().is_empty());
    assert!(pair.host_events.payloads().is_empty());

    // Disconnecting twice is harmless.
    pair.host.disconnect().await;
    assert_eq!(pair.host_events.disconnects().len(), 1);
}

#[tokio::test]
async fn test_peer_closing_record_disconnects() {
    let pair = paired(ProtocolConfig::default()).await;

    pair.relay
        .update_session_record(
            pair.code.as_str(),
            sww_common::SessionRecordUpdate::closed(START_MS + 5),
        )
        .await
        .unwrap();

    assert_eq!(
        pair.relay.record(pair.code.as_str()).unwrap().status,
        RecordStatus::Closed
    );
    assert_eq!(pair.host_events.disconnects(), vec![DisconnectReason::Remote]);
    assert_eq!(pair.guest_events.disconnects(), vec![DisconnectReason::Remote]);
}

#[tokio::test]
async fn test_expired_session_cannot_send() {
    let pair = paired(ProtocolConfig::default()).await;
    pair.clock.advance(Duration::from_secs(24 * 60 * 60 + 1));

    let err = pair.host.send_payload(thumbs_up()).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::SessionExpired));
    assert_eq!(pair.host.status(), ConnectionStatus::Disconnected);
    assert_eq!(pair.host_events.disconnects(), vec![DisconnectReason::Expired]);

    assert!(pair.guest.check_expiry());
    assert_eq!(pair.guest_events.disconnects(), vec![DisconnectReason::Expired]);
    assert!(!pair.guest.check_expiry());
}

#[tokio::test(start_paused = true)]
async fn test_send_retries_then_recovers() {
    let pair = paired(ProtocolConfig::default()).await;

    pair.relay.fail_next_writes(2);
    pair.host.send_payload(thumbs_up()).await.unwrap();

    assert_eq!(
        pair.host_events.statuses()[2..],
        [ConnectionStatus::Degraded, ConnectionStatus::Connected]
    );
    assert_eq!(pair.guest_events.payloads(), vec![thumbs_up()]);
}

#[tokio::test(start_paused = true)]
async fn test_send_gives_up_after_max_attempts() {
    let pair = paired(ProtocolConfig::default()).await;

    pair.relay.fail_next_writes(3);
    let err = pair.host.send_payload(thumbs_up()).await.unwrap_err();

    assert!(matches!(err, CoordinatorError::Transport(_)));
    assert!(err.is_retryable());
    assert_eq!(pair.host.status(), ConnectionStatus::Error);
    assert!(pair.guest_events.payloads().is_empty());

    // The session survives and the next send succeeds.
    pair.host.send_payload(thumbs_up()).await.unwrap();
    assert_eq!(pair.host.status(), ConnectionStatus::Connected);
    assert_eq!(pair.guest_events.payloads(), vec![thumbs_up()]);
}

#[tokio::test(start_paused = true)]
async fn test_guest_publish_failure_rolls_back() {
    let relay = MemoryMailbox::new();
    let clock = ManualClock::new(START_MS);
    let host = device(&relay, &clock, ProtocolConfig::default());
    let guest = device(&relay, &clock, ProtocolConfig::default());

    let offer = host.create_session().await.unwrap();
    relay.fail_next_writes(3);

    let err = guest.connect_with_qr(&offer.payload).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(guest.status(), ConnectionStatus::Disconnected);
    assert_eq!(host.status(), ConnectionStatus::Advertising);
    assert!(relay
        .record(offer.session_code.as_str())
        .unwrap()
        .guest_public_key
        .is_none());

    guest.connect_with_qr(&offer.payload).await.unwrap();
    assert_eq!(host.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_advertisement_publish_failure() {
    let relay = MemoryMailbox::new();
    let clock = ManualClock::new(START_MS);
    let host = device(&relay, &clock, ProtocolConfig::default());

    relay.set_offline(true);
    let err = host.create_session().await.unwrap_err();
    assert!(matches!(err, CoordinatorError::AdvertisementPublishFailed(_)));
    assert_eq!(host.status(), ConnectionStatus::Disconnected);

    relay.set_offline(false);
    assert!(host.create_session().await.is_ok());
}

struct NoEntropy;

#[async_trait]
impl EntropySource for NoEntropy {
    async fn fill(&self, _dest: &mut [u8]) -> Result<(), PrngError> {
        Err(PrngError::EntropyUnavailable("no entropy in test".into()))
    }
}

#[tokio::test]
async fn test_missing_entropy_blocks_session_creation() {
    let relay = MemoryMailbox::new();
    let host = ConnectionCoordinator::from_parts(
        relay.clone(),
        DeviceId::generate().unwrap(),
        ProtocolConfig::default(),
        ManualClock::new(START_MS),
        CryptoPrng::with_source(NoEntropy),
    );

    let err = host.create_session().await.unwrap_err();
    assert!(matches!(err, CoordinatorError::EntropyUnavailable(_)));
    assert_eq!(err.kind(), ErrorKind::Entropy);
    assert_eq!(host.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_listener_can_call_back_into_coordinator() {
    let pair = paired(ProtocolConfig::default()).await;

    let guest = pair.guest.clone();
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let _listener = pair.guest.events().on_payload(move |_| {
        *sink.lock().unwrap() = Some(guest.status());
    });

    pair.host.send_payload(thumbs_up()).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(ConnectionStatus::Connected));
}

/// Which relay write [`GatedMailbox`] holds back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    PublishRecord,
    UpdateRecord,
}

/// Relay that parks the first write of one kind until the test releases it.
#[derive(Clone)]
struct GatedMailbox {
    relay: MemoryMailbox,
    armed: Arc<Mutex<Option<Gate>>>,
    session: Arc<Mutex<Option<String>>>,
    started: Arc<Notify>,
    release: Arc<Notify>,
}

impl GatedMailbox {
    fn new(relay: &MemoryMailbox, gate: Gate) -> Self {
        Self {
            relay: relay.clone(),
            armed: Arc::new(Mutex::new(Some(gate))),
            session: Arc::new(Mutex::new(None)),
            started: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }

    async fn hold(&self, op: Gate, session_id: &str) {
        let parked = {
            let mut armed = self.armed.lock().unwrap();
            if *armed == Some(op) {
                *armed = None;
                true
            } else {
                false
            }
        };
        if parked {
            *self.session.lock().unwrap() = Some(session_id.to_string());
            self.started.notify_one();
            self.release.notified().await;
        }
    }

    fn held_session(&self) -> String {
        self.session.lock().unwrap().clone().unwrap()
    }
}

#[async_trait]
impl MailboxTransport for GatedMailbox {
    async fn publish_session_record(
        &self,
        session_id: &str,
        record: SessionRecord,
    ) -> Result<(), TransportError> {
        self.hold(Gate::PublishRecord, session_id).await;
        self.relay.publish_session_record(session_id, record).await
    }

    async fn read_session_record(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, TransportError> {
        self.relay.read_session_record(session_id).await
    }

    async fn update_session_record(
        &self,
        session_id: &str,
        update: SessionRecordUpdate,
    ) -> Result<(), TransportError> {
        self.hold(Gate::UpdateRecord, session_id).await;
        self.relay.update_session_record(session_id, update).await
    }

    async fn delete_session_record(&self, session_id: &str) -> Result<(), TransportError> {
        self.relay.delete_session_record(session_id).await
    }

    async fn publish_envelope(
        &self,
        session_id: &str,
        envelope: EncryptedEnvelope,
    ) -> Result<(), TransportError> {
        self.relay.publish_envelope(session_id, envelope).await
    }

    fn subscribe_to_session_record(
        &self,
        session_id: &str,
        callback: RecordCallback,
    ) -> Subscription {
        self.relay.subscribe_to_session_record(session_id, callback)
    }

    fn subscribe_to_envelopes(
        &self,
        session_id: &str,
        since_ms: u64,
        callback: EnvelopeCallback,
    ) -> Subscription {
        self.relay.subscribe_to_envelopes(session_id, since_ms, callback)
    }
}

fn gated_device(
    gated: &GatedMailbox,
    clock: &ManualClock,
) -> ConnectionCoordinator<GatedMailbox, ManualClock, OsEntropy> {
    ConnectionCoordinator::from_parts(
        gated.clone(),
        DeviceId::generate().unwrap(),
        ProtocolConfig::default(),
        clock.clone(),
        CryptoPrng::new(),
    )
}

#[tokio::test]
async fn test_disconnect_during_advertisement_publish() {
    let relay = MemoryMailbox::new();
    let clock = ManualClock::new(START_MS);
    let gated = GatedMailbox::new(&relay, Gate::PublishRecord);
    let host = gated_device(&gated, &clock);
    let events = Recorder::attach(&host);

    let (created, ()) = tokio::join!(host.create_session(), async {
        gated.started.notified().await;
        host.disconnect().await;
        gated.release.notify_one();
    });

    assert!(matches!(created, Err(CoordinatorError::NotConnected)));
    assert_eq!(host.status(), ConnectionStatus::Disconnected);
    assert!(host.connection().is_none());
    // No Advertising after the teardown.
    assert_eq!(events.statuses(), vec![ConnectionStatus::Disconnected]);
    assert_eq!(events.disconnects(), vec![DisconnectReason::Local]);

    let code = gated.held_session();
    assert!(relay.record(&code).is_none());
    assert_eq!(relay.subscriber_count(&code), 0);

    // The coordinator is free for a new session.
    assert!(host.create_session().await.is_ok());
}

#[tokio::test]
async fn test_disconnect_during_guest_key_publish() {
    let relay = MemoryMailbox::new();
    let clock = ManualClock::new(START_MS);
    let host = device(&relay, &clock, ProtocolConfig::default());
    let gated = GatedMailbox::new(&relay, Gate::UpdateRecord);
    let guest = gated_device(&gated, &clock);
    let host_events = Recorder::attach(&host);
    let guest_events = Recorder::attach(&guest);

    let offer = host.create_session().await.unwrap();
    let (joined, ()) = tokio::join!(guest.connect_with_qr(&offer.payload), async {
        gated.started.notified().await;
        guest.disconnect().await;
        gated.release.notify_one();
    });

    assert!(matches!(joined, Err(CoordinatorError::SessionUnavailable(_))));
    assert_eq!(guest.status(), ConnectionStatus::Disconnected);
    assert_eq!(
        guest_events.statuses(),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Disconnected]
    );
    assert_eq!(guest_events.disconnects(), vec![DisconnectReason::Local]);
    assert_eq!(*guest_events.connects.lock().unwrap(), 0);

    let code = offer.session_code.as_str();
    assert!(relay.record(code).is_none());
    assert_eq!(relay.subscriber_count(code), 0);
    assert_eq!(host_events.disconnects(), vec![DisconnectReason::Remote]);
    assert_eq!(*host_events.connects.lock().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_send_backoff_stops_retrying() {
    let pair = paired(ProtocolConfig::default()).await;
    let code = pair.code.as_str();

    // One failure puts the send into backoff; a second attempt would land.
    pair.relay.fail_next_writes(1);
    let (sent, ()) = tokio::join!(pair.host.send_payload(thumbs_up()), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        pair.host.disconnect().await;
    });

    assert!(matches!(sent, Err(CoordinatorError::NotConnected)));
    assert_eq!(
        pair.host_events.statuses(),
        vec![
            ConnectionStatus::Advertising,
            ConnectionStatus::Connected,
            ConnectionStatus::Degraded,
            ConnectionStatus::Disconnected,
        ]
    );
    assert_eq!(pair.host_events.disconnects(), vec![DisconnectReason::Local]);
    assert!(pair.relay.envelopes(code).is_empty());
    assert!(pair.relay.record(code).is_none());
    assert!(pair.guest_events.payloads().is_empty());
    assert_eq!(pair.guest_events.disconnects(), vec![DisconnectReason::Remote]);
}
