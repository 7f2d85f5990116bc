//! Common types used across Sluice

use crate::error::{Result, SluiceError};
use serde::{Deserialize, Serialize};

/// Checksum algorithm type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
            ChecksumAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

// ============================================================================
// Warehouse Identifiers
// ============================================================================

/// A SQL identifier that is safe to interpolate into statements.
///
/// Table and column names cannot be bound as query parameters, so they are
/// validated once on construction instead. Dotted names (`schema.table`) are
/// accepted when every segment is valid.
///
/// # Examples
///
/// ```
/// use sluice_common::types::Identifier;
///
/// let table = Identifier::parse("spotify.bronze_sp_all_items").unwrap();
/// assert_eq!(table.as_str(), "spotify.bronze_sp_all_items");
/// assert!(Identifier::parse("items; drop table x").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// Validate and wrap an identifier
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(SluiceError::InvalidIdentifier("empty identifier".to_string()));
        }

        for segment in raw.split('.') {
            let mut chars = segment.chars();
            let valid_start = chars
                .next()
                .map(|c| c.is_ascii_alphabetic() || c == '_')
                .unwrap_or(false);
            let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');

            if !valid_start || !valid_rest {
                return Err(SluiceError::InvalidIdentifier(raw.to_string()));
            }
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Identifier {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = SluiceError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}
