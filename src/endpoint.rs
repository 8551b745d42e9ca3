//! EndpointId - normalisierte Teilnehmer-Kennung
//!
//! Eine Kennung ist die kanonische Telefonnummer (`+<Ziffern>`).
//! Sie wird als Schlüssel unter `users/` und als `from`/`to`
//! in Call-Records verwendet.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Endpoint id is empty")]
    Empty,

    #[error("Invalid character {0:?} in endpoint id")]
    InvalidCharacter(char),

    #[error("Expected {expected} digits, got {actual}")]
    WrongLength { expected: usize, actual: usize },
}

/// Normalisierte Kennung eines registrierten Endpunkts
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointId(String);

impl EndpointId {
    /// Übernimmt eine bereits kanonische Kennung (`+<Ziffern>`)
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let raw = raw.trim();
        let digits = raw.strip_prefix('+').unwrap_or(raw);
        if digits.is_empty() {
            return Err(EndpointError::Empty);
        }
        if let Some(c) = digits.chars().find(|c| !c.is_ascii_digit()) {
            return Err(EndpointError::InvalidCharacter(c));
        }
        Ok(Self(format!("+{}", digits)))
    }

    /// Baut die Kennung aus gewählten Ziffern.
    ///
    /// Exakt `number_length` Ziffern bekommen den Länder-Prefix vorangestellt,
    /// eine Eingabe mit führendem `+` wird unverändert übernommen.
    pub fn from_dialed(
        dialed: &str,
        country_prefix: &str,
        number_length: usize,
    ) -> Result<Self, EndpointError> {
        let dialed = dialed.trim();
        if dialed.starts_with('+') {
            return Self::parse(dialed);
        }
        if dialed.is_empty() {
            return Err(EndpointError::Empty);
        }
        if let Some(c) = dialed.chars().find(|c| !c.is_ascii_digit()) {
            return Err(EndpointError::InvalidCharacter(c));
        }
        if dialed.len() != number_length {
            return Err(EndpointError::WrongLength {
                expected: number_length,
                actual: dialed.len(),
            });
        }
        Self::parse(&format!("{}{}", country_prefix, dialed))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EndpointId {
    type Error = EndpointError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EndpointId> for String {
    fn from(id: EndpointId) -> Self {
        id.0
    }
}

impl AsRef<str> for EndpointId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// TESTS
// ============================================================================
