//! Identity types: stable keys, display names, and the identity record.
//!
//! An identity's key never changes. Its display name does, and every
//! name-keyed lookup in this crate goes through [`fold_name`] so that
//! `DaJJay`, `dajjay` and ` DAJJAY ` address the same record while the
//! casing supplied by the directory is what gets written.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Longest display name accepted before any policy is applied.
pub const MAX_NAME_LEN: usize = 64;

/// Case-folds a name for lookups and index keys.
///
/// Minecraft usernames are ASCII, so ASCII lowercasing is a complete fold.
#[must_use]
pub fn fold_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Stable, immutable identity key (a Mojang profile UUID).
///
/// Displays in the undashed 32-hex form Mojang's APIs return, and parses
/// both the dashed and undashed forms.
///
/// # Examples
///
/// ```
/// use namesake::IdentityKey;
///
/// let a: IdentityKey = "069a79f444e94726a5befca90e38aaf5".parse().unwrap();
/// let b: IdentityKey = "069a79f4-44e9-4726-a5be-fca90e38aaf5".parse().unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.to_string(), "069a79f444e94726a5befca90e38aaf5");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(Uuid);

impl IdentityKey {
    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a random key. Intended for tests and fixtures.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns true if `raw` looks like a key rather than a name.
    ///
    /// Used to disambiguate `history <id-or-name>` style inputs. Names are
    /// capped well below 32 characters by Mojang, so a successful UUID parse
    /// is unambiguous.
    #[must_use]
    pub fn looks_like_key(raw: &str) -> bool {
        Uuid::parse_str(raw.trim()).is_ok()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for IdentityKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| ValidationError::InvalidIdentityKey {
                value: s.to_string(),
            })
    }
}

impl From<Uuid> for IdentityKey {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// A validated display name, stored with its original casing.
///
/// Equality is exact (casing included); use [`DisplayName::folded`] or
/// [`DisplayName::eq_folded`] for identity-of-name comparisons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DisplayName(String);

impl DisplayName {
    /// Validates and wraps a display name.
    ///
    /// Surrounding whitespace is trimmed. The name must be non-empty, at most
    /// [`MAX_NAME_LEN`] characters, and free of inner whitespace and control
    /// characters. Stricter rules (the Minecraft character set) are applied
    /// by the resolver's configured name pattern.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing the first rule violated.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, ValidationError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if trimmed.chars().count() > MAX_NAME_LEN {
            return Err(ValidationError::NameTooLong {
                name: trimmed.to_string(),
                max_length: MAX_NAME_LEN,
            });
        }
        if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ValidationError::InvalidName {
                name: trimmed.to_string(),
                reason: "contains whitespace or control characters".to_string(),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The name as supplied, casing preserved.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The case-folded lookup key.
    #[must_use]
    pub fn folded(&self) -> String {
        fold_name(&self.0)
    }

    /// Case-insensitive comparison against another name.
    #[must_use]
    pub fn eq_folded(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other.trim())
    }
}

impl fmt::Display for DisplayName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DisplayName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DisplayName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DisplayName> for String {
    fn from(name: DisplayName) -> Self {
        name.0
    }
}

impl FromStr for DisplayName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// The identity table row: a stable key and the name it currently goes by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable key; never changes once linked.
    pub id: IdentityKey,
    /// The name the directory last reported for this key.
    pub current_name: DisplayName,
    /// When the directory last confirmed `current_name`.
    pub last_verified: DateTime<Utc>,
}

impl Identity {
    /// Creates an identity verified at `at`.
    #[must_use]
    pub const fn new(id: IdentityKey, current_name: DisplayName, at: DateTime<Utc>) -> Self {
        Self {
            id,
            current_name,
            last_verified: at,
        }
    }

    /// Returns true if the mapping should be re-checked against the directory.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, freshness: Duration) -> bool {
        now.signed_duration_since(self.last_verified) >= freshness
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parses_dashed_and_simple_forms() {
        let simple: IdentityKey = "853c80ef3c3749fdaa49938b674adae6".parse().unwrap();
        let dashed: IdentityKey = "853c80ef-3c37-49fd-aa49-938b674adae6".parse().unwrap();
        assert_eq!(simple, dashed);
        assert_eq!(dashed.to_string(), "853c80ef3c3749fdaa49938b674adae6");

        assert!(matches!(
            "not-a-key".parse::<IdentityKey>(),
            Err(ValidationError::InvalidIdentityKey { .. })
        ));
        assert!(IdentityKey::looks_like_key(" 853c80ef3c3749fdaa49938b674adae6 "));
        assert!(!IdentityKey::looks_like_key("DaJJay"));
    }

    #[test]
    fn display_name_trims_and_preserves_casing() {
        let name = DisplayName::new("  DaJJay ").unwrap();
        assert_eq!(name.as_str(), "DaJJay");
        assert_eq!(name.folded(), "dajjay");
        assert!(name.eq_folded("DAJJAY"));
        assert_ne!(name, DisplayName::new("dajjay").unwrap());
    }

    #[test]
    fn display_name_rejects_bad_input() {
        assert!(matches!(DisplayName::new("   "), Err(ValidationError::EmptyName)));
        assert!(matches!(
            DisplayName::new("two words"),
            Err(ValidationError::InvalidName { .. })
        ));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            DisplayName::new(long),
            Err(ValidationError::NameTooLong { .. })
        ));
    }

    #[test]
    fn display_name_serde_validates() {
        let ok: DisplayName = serde_json::from_str("\"Jyyroh\"").unwrap();
        assert_eq!(ok.as_str(), "Jyyroh");
        assert!(serde_json::from_str::<DisplayName>("\"\"").is_err());
    }

    #[test]
    fn staleness_uses_freshness_window() {
        let t0 = Utc::now();
        let identity = Identity::new(IdentityKey::random(), DisplayName::new("a").unwrap(), t0);
        assert!(!identity.is_stale(t0 + Duration::minutes(5), Duration::minutes(10)));
        assert!(identity.is_stale(t0 + Duration::minutes(10), Duration::minutes(10)));
    }
}
