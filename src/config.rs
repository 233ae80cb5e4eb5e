//! Configuration for namesake.
//!
//! Every struct deserializes from JSON with all fields optional, falling
//! back to [`Default`]. Call `validate()` before use; the entry points in
//! this crate do so themselves.

use std::path::Path;
use std::time::Duration as StdDuration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::directory::RetryPolicy;
use crate::error::{NamesakeError, ValidationError};

fn invalid(field: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidConfig {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamesakeConfig {
    /// How long a stored mapping is trusted before re-checking the directory.
    pub freshness_secs: u64,
    /// Pattern a requested name must match. Minecraft usernames by default.
    pub name_pattern: String,
    /// Parallel workers for backfill; 1 runs sequentially.
    pub backfill_workers: usize,
    /// Directory provider chain settings.
    pub directory: DirectoryConfig,
    /// Durable storage settings.
    pub storage: PersistentConfig,
}

impl Default for NamesakeConfig {
    fn default() -> Self {
        Self {
            freshness_secs: 15 * 60,
            name_pattern: "^[A-Za-z0-9_]{1,16}$".to_string(),
            backfill_workers: 4,
            directory: DirectoryConfig::default(),
            storage: PersistentConfig::default(),
        }
    }
}

impl NamesakeConfig {
    const MAX_BACKFILL_WORKERS: usize = 64;

    /// Checks every field, returning the config unchanged when valid.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidConfig`] naming the first bad field.
    pub fn validate(self) -> Result<Self, ValidationError> {
        self.compile_name_pattern()?;
        if self.backfill_workers == 0 || self.backfill_workers > Self::MAX_BACKFILL_WORKERS {
            return Err(invalid(
                "backfill_workers",
                format!(
                    "must be between 1 and {} (got {})",
                    Self::MAX_BACKFILL_WORKERS,
                    self.backfill_workers
                ),
            ));
        }
        let freshness = i64::try_from(self.freshness_secs).ok();
        if freshness.and_then(chrono::Duration::try_seconds).is_none() {
            return Err(invalid("freshness_secs", "out of range"));
        }
        let directory = self.directory.clone().validate()?;
        let storage = self.storage.clone().validate()?;
        Ok(Self {
            directory,
            storage,
            ..self
        })
    }

    /// Loads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, NamesakeError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| invalid("config", format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| invalid("config", format!("cannot parse {}: {e}", path.display())))?;
        Ok(config.validate()?)
    }

    /// Freshness window as a duration.
    #[must_use]
    pub fn freshness(&self) -> chrono::Duration {
        i64::try_from(self.freshness_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Compiles the name pattern.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidConfig`] if the pattern is not a
    /// valid regex.
    pub fn compile_name_pattern(&self) -> Result<Regex, ValidationError> {
        Regex::new(&self.name_pattern).map_err(|e| invalid("name_pattern", e.to_string()))
    }
}

/// Directory provider chain settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Per-call timeout in milliseconds.
    pub call_timeout_ms: u64,
    /// Calls per provider before moving to the next one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Upper bound on the retry delay.
    pub max_backoff_ms: u64,
    /// Factor applied to the delay after each retry.
    pub backoff_multiplier: u32,
    /// Base URL of the Mojang profile API.
    pub mojang_api_base: String,
    /// Base URL of the Mojang session server.
    pub mojang_session_base: String,
    /// Base URL of PlayerDB.
    pub playerdb_base: String,
    /// User-Agent sent with HTTP lookups.
    pub user_agent: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
            backoff_multiplier: 2,
            mojang_api_base: "https://api.mojang.com".to_string(),
            mojang_session_base: "https://sessionserver.mojang.com".to_string(),
            playerdb_base: "https://playerdb.co".to_string(),
            user_agent: concat!("namesake/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DirectoryConfig {
    const MIN_CALL_TIMEOUT_MS: u64 = 50;
    const MAX_ATTEMPTS: u32 = 10;

    /// Checks every field, returning the config unchanged when valid.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidConfig`] naming the first bad field.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.call_timeout_ms < Self::MIN_CALL_TIMEOUT_MS {
            return Err(invalid(
                "directory.call_timeout_ms",
                format!(
                    "must be at least {}ms (got {})",
                    Self::MIN_CALL_TIMEOUT_MS,
                    self.call_timeout_ms
                ),
            ));
        }
        if self.max_attempts == 0 || self.max_attempts > Self::MAX_ATTEMPTS {
            return Err(invalid(
                "directory.max_attempts",
                format!("must be between 1 and {} (got {})", Self::MAX_ATTEMPTS, self.max_attempts),
            ));
        }
        if self.backoff_multiplier == 0 {
            return Err(invalid("directory.backoff_multiplier", "must be at least 1"));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(invalid(
                "directory.initial_backoff_ms",
                format!("exceeds max_backoff_ms ({})", self.max_backoff_ms),
            ));
        }
        for (field, url) in [
            ("directory.mojang_api_base", &self.mojang_api_base),
            ("directory.mojang_session_base", &self.mojang_session_base),
            ("directory.playerdb_base", &self.playerdb_base),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid(field, format!("'{url}' is not an http(s) URL")));
            }
        }
        Ok(self)
    }

    /// Per-call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.call_timeout_ms)
    }

    /// Retry policy for each provider.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: StdDuration::from_millis(self.initial_backoff_ms),
            max_backoff: StdDuration::from_millis(self.max_backoff_ms),
            multiplier: self.backoff_multiplier,
        }
    }
}

/// Durable storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// WAL size that triggers an automatic checkpoint (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every commit (slower but safer).
    pub sync_on_write: bool,
    /// Snapshot files kept after a checkpoint.
    pub retain_snapshots: usize,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024, // 64 MB
            sync_on_write: true,
            retain_snapshots: 2,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024; // 4 KiB minimum to avoid degenerate checkpoint loops

    /// Checks every field, returning the config unchanged when valid.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidConfig`] naming the first bad field.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(invalid(
                "storage.max_wal_size",
                format!(
                    "must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            ));
        }
        if self.retain_snapshots == 0 {
            return Err(invalid("storage.retain_snapshots", "must keep at least one snapshot"));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NamesakeConfig::default().validate().unwrap();
        assert_eq!(config.freshness(), chrono::Duration::minutes(15));
        assert!(config.compile_name_pattern().unwrap().is_match("DaJJay_01"));
        assert!(!config.compile_name_pattern().unwrap().is_match("has space"));
        assert_eq!(config.directory.call_timeout(), StdDuration::from_secs(5));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: NamesakeConfig =
            serde_json::from_str(r#"{ "freshness_secs": 60, "directory": { "max_attempts": 5 } }"#)
                .unwrap();
        assert_eq!(config.freshness_secs, 60);
        assert_eq!(config.directory.max_attempts, 5);
        assert_eq!(config.directory.call_timeout_ms, 5_000);
        assert_eq!(config.storage, PersistentConfig::default());
    }

    #[test]
    fn rejects_bad_fields() {
        let bad_pattern = NamesakeConfig {
            name_pattern: "([".to_string(),
            ..NamesakeConfig::default()
        };
        assert!(matches!(
            bad_pattern.validate(),
            Err(ValidationError::InvalidConfig { field, .. }) if field == "name_pattern"
        ));

        let no_workers = NamesakeConfig {
            backfill_workers: 0,
            ..NamesakeConfig::default()
        };
        assert!(no_workers.validate().is_err());

        let mut config = NamesakeConfig::default();
        config.directory.initial_backoff_ms = 10_000;
        assert!(config.validate().is_err());

        let mut config = NamesakeConfig::default();
        config.directory.playerdb_base = "playerdb.co".to_string();
        assert!(config.validate().is_err());

        let mut config = NamesakeConfig::default();
        config.storage.max_wal_size = 16;
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_policy_mirrors_config() {
        let policy = DirectoryConfig::default().retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, StdDuration::from_millis(250));
        assert_eq!(policy.multiplier, 2);
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("namesake.json");
        std::fs::write(&path, r#"{ "backfill_workers": 2 }"#).unwrap();
        assert_eq!(NamesakeConfig::from_json_file(&path).unwrap().backfill_workers, 2);

        std::fs::write(&path, "not json").unwrap();
        assert!(NamesakeConfig::from_json_file(&path).unwrap_err().is_validation());
    }
}
