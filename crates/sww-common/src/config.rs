//! Protocol tunables.
//!
//! Defaults match the pairing protocol: 5 minute advertisements, 24 hour
//! sessions. Every field can be overridden from `SWW_*` environment
//! variables.

use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_ADVERTISEMENT_MAX_AGE_SECS: &str = "SWW_ADVERTISEMENT_MAX_AGE_SECS";
pub const ENV_SESSION_TTL_SECS: &str = "SWW_SESSION_TTL_SECS";
pub const ENV_SEND_MAX_ATTEMPTS: &str = "SWW_SEND_MAX_ATTEMPTS";
pub const ENV_SEND_BACKOFF_MS: &str = "SWW_SEND_BACKOFF_MS";
pub const ENV_REORDER_WINDOW_SECS: &str = "SWW_REORDER_WINDOW_SECS";

/// Bounded retry with exponential backoff for relay writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), doubling each time.
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        let delay = self.initial_backoff.saturating_mul(1u32 << shift);
        delay.min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Advertisements older than this are rejected.
    pub advertisement_max_age: Duration,
    /// How far in the future an advertisement timestamp may be.
    pub max_clock_skew: Duration,
    /// Session lifetime from creation.
    pub session_ttl: Duration,
    pub send_retry: RetryPolicy,
    /// Envelopes this far behind the newest one seen are still accepted.
    pub reorder_window: Duration,
    /// Processed envelope ids remembered for deduplication.
    pub dedup_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            advertisement_max_age: Duration::from_secs(5 * 60),
            max_clock_skew: Duration::from_secs(60),
            session_ttl: Duration::from_secs(24 * 60 * 60),
            send_retry: RetryPolicy::default(),
            reorder_window: Duration::from_secs(30),
            dedup_capacity: 1024,
        }
    }
}

impl ProtocolConfig {
    /// Defaults overridden by `SWW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(secs) = read_positive(&lookup, ENV_ADVERTISEMENT_MAX_AGE_SECS)? {
            config.advertisement_max_age = Duration::from_secs(secs);
        }
        if let Some(secs) = read_positive(&lookup, ENV_SESSION_TTL_SECS)? {
            config.session_ttl = Duration::from_secs(secs);
        }
        if let Some(attempts) = read_positive(&lookup, ENV_SEND_MAX_ATTEMPTS)? {
            config.send_retry.max_attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        }
        if let Some(ms) = read_positive(&lookup, ENV_SEND_BACKOFF_MS)? {
            config.send_retry.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = read_positive(&lookup, ENV_REORDER_WINDOW_SECS)? {
            config.reorder_window = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn advertisement_max_age_ms(&self) -> u64 {
        duration_ms(self.advertisement_max_age)
    }

    pub fn max_clock_skew_ms(&self) -> u64 {
        duration_ms(self.max_clock_skew)
    }

    pub fn session_ttl_ms(&self) -> u64 {
        duration_ms(self.session_ttl)
    }

    pub fn reorder_window_ms(&self) -> u64 {
        duration_ms(self.reorder_window)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn read_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };

    let value: u64 = raw.trim().parse().map_err(|_| ConfigError::Unparsable {
        name: name.to_string(),
        value: raw.clone(),
    })?;

    if value == 0 {
        return Err(ConfigError::Zero {
            name: name.to_string(),
        });
    }

    Ok(Some(value))
}
