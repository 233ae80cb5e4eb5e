//! Error types for namesake.
//!
//! All errors are strongly typed with thiserror. The taxonomy follows how
//! each failure is handled:
//!
//! - directory trouble ([`ProviderError`], [`DirectoryUnavailable`]) is
//!   recovered inside the resolver by falling back to the stored mapping;
//! - migration trouble ([`MigrationError`]) always reaches the caller;
//! - "no such name" is not an error at all, see `Resolution::NotFound`.

use thiserror::Error;

use crate::identity::{DisplayName, IdentityKey};
use crate::storage::StorageError;

/// Input validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Display name cannot be empty")]
    EmptyName,

    #[error("Display name '{name}' exceeds maximum length of {max_length}")]
    NameTooLong {
        name: String,
        max_length: usize,
    },

    #[error("Display name '{name}' is invalid: {reason}")]
    InvalidName {
        name: String,
        reason: String,
    },

    #[error("Display name '{name}' does not match pattern {pattern}")]
    NameRejectedByPolicy {
        name: String,
        pattern: String,
    },

    #[error("'{value}' is not a valid identity key")]
    InvalidIdentityKey {
        value: String,
    },

    #[error("Invalid configuration for '{field}': {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },
}

/// A single directory provider call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("{provider}: call timed out after {timeout_ms}ms")]
    Timeout {
        provider: String,
        timeout_ms: u64,
    },

    #[error("{provider}: transport error: {message}")]
    Transport {
        provider: String,
        message: String,
    },

    #[error("{provider}: unexpected HTTP status {status}")]
    HttpStatus {
        provider: String,
        status: u16,
    },

    #[error("{provider}: malformed response: {message}")]
    MalformedResponse {
        provider: String,
        message: String,
    },
}

impl ProviderError {
    /// Name of the provider that failed.
    #[must_use]
    pub fn provider(&self) -> &str {
        match self {
            Self::Timeout { provider, .. }
            | Self::Transport { provider, .. }
            | Self::HttpStatus { provider, .. }
            | Self::MalformedResponse { provider, .. } => provider,
        }
    }

    /// Returns true if retrying the same provider may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport { .. } => true,
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::MalformedResponse { .. } => false,
        }
    }
}

/// Every provider in the chain exhausted its retry budget.
///
/// Recovered locally: the resolver falls back to the stored mapping and
/// reports this as a warning on the resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize)]
#[error("directory unavailable after {attempts} attempt(s) across {providers} provider(s){}", .last_error.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
pub struct DirectoryUnavailable {
    /// Providers consulted.
    pub providers: usize,
    /// Calls made across all providers.
    pub attempts: u32,
    /// The last error observed, rendered.
    pub last_error: Option<String>,
}

/// Migration errors. These are never absorbed by the resolver.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The new name is the active name of a different identity.
    #[error("Name '{name}' is already active for identity {holder}; cannot assign it to {requester}")]
    Conflict {
        name: DisplayName,
        holder: IdentityKey,
        requester: IdentityKey,
    },

    /// The transaction did not commit; the store is unchanged.
    #[error("Migration for identity {identity} failed and was rolled back: {source}")]
    Failed {
        identity: IdentityKey,
        #[source]
        source: StorageError,
    },

    /// No identity row exists for the key.
    #[error("Identity {identity} is not linked")]
    UnknownIdentity {
        identity: IdentityKey,
    },

    /// A caller passed a lock guard for a different identity.
    #[error("Lock held for identity {held} but migration targets {expected}")]
    LockMismatch {
        expected: IdentityKey,
        held: IdentityKey,
    },
}

impl MigrationError {
    /// Returns true if the caller may retry the same migration.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Returns true if this is a name conflict between two identities.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Top-level error type for namesake.
#[derive(Debug, Error)]
pub enum NamesakeError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl NamesakeError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a migration conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Migration(MigrationError::Conflict { .. }))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Storage(e) => e.is_transient(),
            Self::Migration(e) => e.is_retryable(),
        }
    }
}

/// Result type alias for namesake operations.
pub type NamesakeResult<T> = Result<T, NamesakeError>;
