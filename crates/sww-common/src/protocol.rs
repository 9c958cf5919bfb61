//! Wire types shared by both devices and the relay.
//!
//! Everything here is serialized as compact camelCase JSON. The relay only
//! ever sees [`SessionRecord`] and [`EncryptedEnvelope`]; [`Payload`] exists
//! only inside ciphertext.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::code::SessionCode;
use crate::config::ProtocolConfig;
use crate::error::AdvertisementError;
use crate::helpers::ms_to_secs;

/// Fixed tag identifying this protocol in advertisements.
pub const APP_TAG: &str = "speak-without-words";

/// Current advertisement version.
pub const PROTOCOL_VERSION: u32 = 1;

const PUBLIC_KEY_LEN: usize = 32;

// ============================================================================
// Advertisement
// ============================================================================

/// Out-of-band pairing payload carried by a QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAdvertisement {
    #[serde(rename = "app")]
    pub app_tag: String,
    pub version: u32,
    pub session_id: String,
    /// Base64 X25519 public key of the host.
    pub public_key: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl SessionAdvertisement {
    pub fn new(session_id: &SessionCode, public_key_b64: String, timestamp: u64) -> Self {
        Self {
            app_tag: APP_TAG.to_string(),
            version: PROTOCOL_VERSION,
            session_id: session_id.to_string(),
            public_key: public_key_b64,
            timestamp,
        }
    }

    /// Text form for the QR code.
    pub fn to_payload(&self) -> String {
        // A struct of strings and integers cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse without checking freshness.
    pub fn parse(payload: &str) -> Result<Self, AdvertisementError> {
        let value: serde_json::Value = serde_json::from_str(payload.trim())
            .map_err(|e| AdvertisementError::Malformed(e.to_string()))?;

        // Check the tag before the rest of the shape so a foreign QR code
        // is reported as such rather than as a parse failure.
        match value.get("app").and_then(|v| v.as_str()) {
            Some(APP_TAG) => {}
            Some(other) => return Err(AdvertisementError::WrongApp(other.to_string())),
            None => {
                return Err(AdvertisementError::Malformed("missing app tag".into()));
            }
        }

        let ad: Self = serde_json::from_value(value)
            .map_err(|e| AdvertisementError::Malformed(e.to_string()))?;

        if ad.version != PROTOCOL_VERSION {
            return Err(AdvertisementError::UnsupportedVersion(ad.version));
        }

        SessionCode::parse(&ad.session_id)
            .map_err(|e| AdvertisementError::Malformed(format!("session id: {e}")))?;

        let key = STANDARD
            .decode(&ad.public_key)
            .map_err(|e| AdvertisementError::InvalidPublicKey(e.to_string()))?;
        if key.len() != PUBLIC_KEY_LEN {
            return Err(AdvertisementError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LEN,
                key.len()
            )));
        }

        Ok(ad)
    }

    /// Check the timestamp against `now_ms`.
    pub fn validate_freshness(
        &self,
        now_ms: u64,
        config: &ProtocolConfig,
    ) -> Result<(), AdvertisementError> {
        if self.timestamp > now_ms {
            let ahead = self.timestamp - now_ms;
            if ahead > config.max_clock_skew_ms() {
                return Err(AdvertisementError::FutureTimestamp {
                    ahead_secs: ms_to_secs(ahead),
                });
            }
            return Ok(());
        }

        let age = now_ms - self.timestamp;
        if age > config.advertisement_max_age_ms() {
            return Err(AdvertisementError::Stale {
                age_secs: ms_to_secs(age),
            });
        }

        Ok(())
    }

    /// Full validation: structure, app tag, version, key, then freshness.
    pub fn parse_and_validate(
        payload: &str,
        now_ms: u64,
        config: &ProtocolConfig,
    ) -> Result<Self, AdvertisementError> {
        let ad = Self::parse(payload)?;
        ad.validate_freshness(now_ms, config)?;
        Ok(ad)
    }

    pub fn session_code(&self) -> Result<SessionCode, AdvertisementError> {
        SessionCode::parse(&self.session_id)
            .map_err(|e| AdvertisementError::Malformed(format!("session id: {e}")))
    }
}

// ============================================================================
// Relay session record
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Waiting,
    Connected,
    Closed,
}

/// Per-session record kept on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub host_public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_public_key: Option<String>,
    pub status: RecordStatus,
    pub created_at: u64,
    pub last_activity: u64,
}

impl SessionRecord {
    pub fn waiting(code: &SessionCode, host_public_key: String, now_ms: u64) -> Self {
        Self {
            id: code.to_string(),
            host_public_key,
            guest_public_key: None,
            status: RecordStatus::Waiting,
            created_at: now_ms,
            last_activity: now_ms,
        }
    }

    /// Merge a partial update. Absent fields are left untouched.
    pub fn apply(&mut self, update: &SessionRecordUpdate) {
        if let Some(key) = &update.guest_public_key {
            self.guest_public_key = Some(key.clone());
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(ts) = update.last_activity {
            self.last_activity = ts;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecordUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<u64>,
}

impl SessionRecordUpdate {
    /// Guest announces its key and marks the session connected.
    pub fn guest_joined(guest_public_key: String, now_ms: u64) -> Self {
        Self {
            guest_public_key: Some(guest_public_key),
            status: Some(RecordStatus::Connected),
            last_activity: Some(now_ms),
        }
    }

    pub fn closed(now_ms: u64) -> Self {
        Self {
            guest_public_key: None,
            status: Some(RecordStatus::Closed),
            last_activity: Some(now_ms),
        }
    }
}

// ============================================================================
// Envelopes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Signal,
    Text,
    File,
    Image,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Signal => "signal",
            PayloadKind::Text => "text",
            PayloadKind::File => "file",
            PayloadKind::Image => "image",
        }
    }
}

/// Unencrypted hints the relay may see. Only set for file and image kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// One encrypted message on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub id: String,
    pub sender_id: String,
    /// Base64 ciphertext including the tag.
    pub ciphertext: String,
    /// Base64 24-byte nonce.
    pub nonce: String,
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EnvelopeMetadata>,
}

impl EncryptedEnvelope {
    /// New random envelope id.
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// AEAD associated data binding the ciphertext to this envelope's
    /// id, kind and sender.
    pub fn associated_data(id: &str, kind: PayloadKind, sender_id: &str) -> Vec<u8> {
        let mut aad = Vec::with_capacity(16 + id.len() + sender_id.len());
        aad.extend_from_slice(b"sww-envelope-v1");
        for part in [id, kind.as_str(), sender_id] {
            aad.push(0);
            aad.extend_from_slice(part.as_bytes());
        }
        aad
    }

    pub fn aad(&self) -> Vec<u8> {
        Self::associated_data(&self.id, self.kind, &self.sender_id)
    }

    pub fn ciphertext_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.ciphertext)
    }

    pub fn nonce_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.nonce)
    }
}

// ============================================================================
// Plaintext payloads
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GestureType {
    Tap,
    DoubleTap,
    LongPress,
    SwipeLeft,
    SwipeRight,
    SwipeUp,
    SwipeDown,
    Shake,
    Circle,
    Zigzag,
}

/// How a signal is presented on the receiving device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    #[default]
    Icon,
    TapPattern,
    Haptic,
    Light,
    Gesture,
}

/// A deck entry sent as a signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    #[serde(default)]
    pub kind: SignalKind,
    pub deck_entry_id: String,
    pub icon_id: String,
    pub meaning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gesture: Option<GestureType>,
    /// Tap/vibration durations in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl SignalPayload {
    pub fn icon(
        deck_entry_id: impl Into<String>,
        icon_id: impl Into<String>,
        meaning: impl Into<String>,
    ) -> Self {
        Self {
            kind: SignalKind::Icon,
            deck_entry_id: deck_entry_id.into(),
            icon_id: icon_id.into(),
            meaning: meaning.into(),
            gesture: None,
            pattern: None,
            color: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    /// Base64 file contents.
    pub data: String,
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            size: bytes.len() as u64,
            data: STANDARD.encode(bytes),
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data)
    }
}

/// Plaintext carried inside an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    Signal(SignalPayload),
    Text { body: String },
    File(Attachment),
    Image(Attachment),
}

impl Payload {
    pub fn text(body: impl Into<String>) -> Self {
        Payload::Text { body: body.into() }
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Signal(_) => PayloadKind::Signal,
            Payload::Text { .. } => PayloadKind::Text,
            Payload::File(_) => PayloadKind::File,
            Payload::Image(_) => PayloadKind::Image,
        }
    }

    /// Relay-visible metadata. File name and contents stay encrypted.
    pub fn metadata(&self) -> Option<EnvelopeMetadata> {
        match self {
            Payload::File(a) | Payload::Image(a) => Some(EnvelopeMetadata {
                file_size: Some(a.size),
                mime_type: Some(a.mime_type.clone()),
            }),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
