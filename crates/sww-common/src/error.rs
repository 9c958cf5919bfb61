//! Error types for the shared wire and configuration layer.

use thiserror::Error;

/// Why an advertisement payload was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdvertisementError {
    /// Not parseable as an advertisement at all
    #[error("malformed advertisement: {0}")]
    Malformed(String),

    /// Parsed, but belongs to some other app
    #[error("advertisement is for another app: {0:?}")]
    WrongApp(String),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid public key in advertisement: {0}")]
    InvalidPublicKey(String),

    /// Older than the staleness window
    #[error("advertisement is {age_secs}s old")]
    Stale { age_secs: u64 },

    /// Timestamp further in the future than the allowed clock skew
    #[error("advertisement timestamp is {ahead_secs}s in the future")]
    FutureTimestamp { ahead_secs: u64 },
}

impl AdvertisementError {
    /// Stale and future-dated advertisements are "expired" from the user's
    /// point of view: a fresh code is needed.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Stale { .. } | Self::FutureTimestamp { .. })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionCodeError {
    #[error("session code must be {expected} characters, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("session code contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name}: cannot parse {value:?}")]
    Unparsable { name: String, value: String },

    #[error("{name}: must be greater than zero")]
    Zero { name: String },
}

/// Device id persistence errors.
#[derive(Debug, Error)]
pub enum DeviceIdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid device id: {0:?}")]
    Invalid(String),

    #[error("entropy unavailable: {0}")]
    Entropy(String),
}
