//! Shared types for Speak Without Words: wire formats, configuration, logging.
//!
//! This crate provides the pieces every other crate agrees on: the
//! advertisement and envelope formats, session codes, device identity and
//! protocol tunables.

#![forbid(unsafe_code)]

pub mod code;
pub mod config;
pub mod device;
pub mod error;
pub mod helpers;
pub mod protocol;

pub use code::SessionCode;
pub use config::{ProtocolConfig, RetryPolicy};
pub use device::DeviceId;
pub use error::{AdvertisementError, ConfigError, DeviceIdError, SessionCodeError};
pub use protocol::*;

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Initialize tracing with a specific default level.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
