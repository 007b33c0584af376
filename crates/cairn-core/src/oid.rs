use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error as ThisError;
use ulid::Ulid;

///
/// OidError
///

#[derive(Debug, ThisError)]
pub enum OidError {
    #[error("oid is empty")]
    Empty,

    #[error("oid contains forbidden character '{ch}'")]
    ForbiddenChar { ch: char },
}

///
/// Oid
///
/// Opaque object identifier, unique within a class. Generated identifiers
/// are ULIDs, which keep first-save order roughly sortable; imported
/// identifiers may be any printable ASCII string that is safe to embed in a
/// storage key (no separators, no record suffixes).
///

#[derive(
    Clone, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Oid(String);

impl Oid {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Validate an externally supplied identifier.
    pub fn parse(s: &str) -> Result<Self, OidError> {
        if s.is_empty() {
            return Err(OidError::Empty);
        }
        for ch in s.chars() {
            if !ch.is_ascii_graphic() || ch == crate::KEY_SEPARATOR || ch == '.' {
                return Err(OidError::ForbiddenChar { ch });
            }
        }
        Ok(Self(s.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Oid {
    type Err = OidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Oid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
