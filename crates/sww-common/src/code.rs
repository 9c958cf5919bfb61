//! Six-character session codes.
//!
//! Codes are a lookup key on the relay, not a secret and not globally
//! unique. They only need to be easy to read aloud and type.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SessionCodeError;

pub const SESSION_CODE_LEN: usize = 6;

const ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Largest multiple of 36 that fits in a byte. Bytes at or above it are
/// rejected so every symbol is equally likely.
const REJECTION_LIMIT: u8 = 252;

/// Uppercase alphanumeric session code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionCode(String);

impl SessionCode {
    /// Build a code from a stream of random bytes.
    ///
    /// `next_byte` is called until six symbols have been accepted.
    pub fn generate<E>(mut next_byte: impl FnMut() -> Result<u8, E>) -> Result<Self, E> {
        let mut code = String::with_capacity(SESSION_CODE_LEN);
        while code.len() < SESSION_CODE_LEN {
            let byte = next_byte()?;
            if byte < REJECTION_LIMIT {
                code.push(ALPHABET[(byte % 36) as usize] as char);
            }
        }
        Ok(Self(code))
    }

    /// Parse user input. Surrounding whitespace is ignored and lowercase is
    /// accepted.
    pub fn parse(input: &str) -> Result<Self, SessionCodeError> {
        let normalized = input.trim().to_ascii_uppercase();

        let actual = normalized.chars().count();
        if actual != SESSION_CODE_LEN {
            return Err(SessionCodeError::Length {
                expected: SESSION_CODE_LEN,
                actual,
            });
        }

        if let Some(bad) = normalized.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(SessionCodeError::InvalidCharacter(bad));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionCode {
    type Error = SessionCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionCode> for String {
    fn from(code: SessionCode) -> Self {
        code.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[test]
    fn test_generate_maps_bytes_to_alphabet() {
        let mut bytes = [0u8, 1, 25, 26, 35, 36].into_iter();
        let code = SessionCode::generate(|| Ok::<_, Infallible>(bytes.next().unwrap_or(0))).unwrap();
        assert_eq!(code.as_str(), "ABZ09A");
    }

    #[test]
    fn test_generate_rejects_biased_bytes() {
        let mut bytes = [255u8, 252, 1, 2, 3, 4, 5, 6].into_iter();
        let code = SessionCode::generate(|| Ok::<_, Infallible>(bytes.next().unwrap_or(0))).unwrap();
        assert_eq!(code.as_str(), "BCDEFG");
    }

    #[test]
    fn test_generate_propagates_errors() {
        let result: Result<SessionCode, &str> = SessionCode::generate(|| Err("empty"));
        assert_eq!(result.unwrap_err(), "empty");
    }

    #[test]
    fn test_parse_normalizes_input() {
        let code = SessionCode::parse("  ab12cd ").unwrap();
        assert_eq!(code.as_str(), "AB12CD");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            SessionCode::parse("ABC"),
            Err(SessionCodeError::Length { actual: 3, .. })
        ));
        assert!(matches!(
            SessionCode::parse("AB-2CD"),
            Err(SessionCodeError::InvalidCharacter('-'))
        ));
    }

    #[test]
    fn test_serde_validates() {
        let code: SessionCode = serde_json::from_str("\"xy9z01\"").unwrap();
        assert_eq!(code.as_str(), "XY9Z01");
        assert!(serde_json::from_str::<SessionCode>("\"toolongcode\"").is_err());
    }
}
