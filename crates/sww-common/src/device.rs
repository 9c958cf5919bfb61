//! Local device identity.
//!
//! The device id only tells "my own echoed envelopes" apart from the peer's
//! in the mailbox stream. It is not a cryptographic identity and carries no
//! trust.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::DeviceIdError;

const DEVICE_ID_BYTES: usize = 8;

/// 16 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Fresh random id from the OS RNG.
    pub fn generate() -> Result<Self, DeviceIdError> {
        let mut bytes = [0u8; DEVICE_ID_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| DeviceIdError::Entropy(e.to_string()))?;
        Ok(Self(hex::encode(bytes)))
    }

    pub fn parse(input: &str) -> Result<Self, DeviceIdError> {
        let trimmed = input.trim();
        let valid = trimmed.len() == DEVICE_ID_BYTES * 2
            && trimmed
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !valid {
            return Err(DeviceIdError::Invalid(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Read the id stored at `path`, or create and store a new one.
    pub fn load_or_create(path: &Path) -> Result<Self, DeviceIdError> {
        match fs::read_to_string(path) {
            Ok(contents) => return Self::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let id = Self::generate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = open_private(path)?;
        file.write_all(id.0.as_bytes())?;
        file.write_all(b"\n")?;

        tracing::info!("created device id at {}", path.display());
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}
