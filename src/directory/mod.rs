//! Directory services: the authority on which name a key currently holds.
//!
//! A [`DirectoryChain`] consults an ordered list of [`DirectoryProvider`]s.
//! Every call is bounded by a timeout and retried with exponential backoff
//! while the error is retryable; when a provider gives up, the next one is
//! tried. The chain never returns an error: exhaustion is reported as
//! [`DirectoryOutcome::Unavailable`] so callers can fall back to what they
//! already know.

mod memory;

#[cfg(feature = "http")]
mod http;

pub use memory::MemoryDirectory;

#[cfg(feature = "http")]
pub use http::{MojangProvider, PlayerDbProvider};

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use serde::{Deserialize, Serialize};

use crate::config::DirectoryConfig;
use crate::error::{DirectoryUnavailable, ProviderError};
use crate::identity::{DisplayName, IdentityKey};

/// What a directory reports for a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryProfile {
    /// Stable key.
    pub id: IdentityKey,
    /// Current name, in the directory's casing.
    pub name: DisplayName,
}

impl DirectoryProfile {
    /// Creates a profile.
    #[must_use]
    pub const fn new(id: IdentityKey, name: DisplayName) -> Self {
        Self { id, name }
    }
}

/// A source of truth for current names.
///
/// Implementations are blocking; the chain bounds each call with a timeout.
pub trait DirectoryProvider: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Looks up the profile currently holding `name`.
    ///
    /// `Ok(None)` means the provider answered and knows no such name.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the provider could not answer.
    fn lookup(&self, name: &str) -> Result<Option<DirectoryProfile>, ProviderError>;

    /// Looks up the current profile for `key`.
    ///
    /// Providers without key lookups answer `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the provider could not answer.
    fn lookup_by_key(&self, _key: IdentityKey) -> Result<Option<DirectoryProfile>, ProviderError> {
        Ok(None)
    }
}

/// Result of asking the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryOutcome {
    /// A provider knows the profile.
    Found {
        /// The profile.
        profile: DirectoryProfile,
        /// Name of the provider that answered.
        provider: String,
    },
    /// At least one provider answered, and none knew the name.
    NotFound,
    /// No provider could answer.
    Unavailable(DirectoryUnavailable),
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Calls per provider, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any delay.
    pub max_backoff: Duration,
    /// Growth factor between retries.
    pub multiplier: u32,
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Delay before retry number `retry` (0-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(retry);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        DirectoryConfig::default().retry_policy()
    }
}

#[derive(Debug, Clone)]
enum Query {
    Name(String),
    Key(IdentityKey),
}

impl Query {
    fn run(&self, provider: &dyn DirectoryProvider) -> Result<Option<DirectoryProfile>, ProviderError> {
        match self {
            Self::Name(name) => provider.lookup(name),
            Self::Key(key) => provider.lookup_by_key(*key),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "name:{name}"),
            Self::Key(key) => write!(f, "key:{key}"),
        }
    }
}

/// Ordered list of providers with per-call timeout and retry.
#[derive(Clone)]
pub struct DirectoryChain {
    providers: Vec<Arc<dyn DirectoryProvider>>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl fmt::Debug for DirectoryChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.providers.iter().map(|p| p.name()).collect();
        f.debug_struct("DirectoryChain")
            .field("providers", &names)
            .field("retry", &self.retry)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl DirectoryChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new(retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            providers: Vec::new(),
            retry,
            call_timeout,
        }
    }

    /// Creates an empty chain using the timeout and retry settings of `config`.
    #[must_use]
    pub fn from_config(config: &DirectoryConfig) -> Self {
        Self::new(config.retry_policy(), config.call_timeout())
    }

    /// Appends a provider; earlier providers are consulted first.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn DirectoryProvider>) -> Self {
        self.push(provider);
        self
    }

    /// Appends a provider in place.
    pub fn push(&mut self, provider: Arc<dyn DirectoryProvider>) {
        self.providers.push(provider);
    }

    /// Number of providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Returns true if the chain has no providers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Asks for the profile currently holding `name`.
    #[must_use]
    pub fn lookup(&self, name: &str) -> DirectoryOutcome {
        self.run(&Query::Name(name.trim().to_string()))
    }

    /// Asks for the current profile of `key`.
    #[must_use]
    pub fn lookup_by_key(&self, key: IdentityKey) -> DirectoryOutcome {
        self.run(&Query::Key(key))
    }

    fn run(&self, query: &Query) -> DirectoryOutcome {
        let mut attempts = 0u32;
        let mut answered = false;
        let mut last_error: Option<ProviderError> = None;

        for provider in &self.providers {
            for attempt in 0..self.retry.max_attempts.max(1) {
                if attempt > 0 {
                    thread::sleep(self.retry.backoff(attempt - 1));
                }
                attempts += 1;
                match self.call(provider, query) {
                    Ok(Some(profile)) => {
                        tracing::debug!(provider = provider.name(), %query, id = %profile.id, "directory hit");
                        return DirectoryOutcome::Found {
                            profile,
                            provider: provider.name().to_string(),
                        };
                    }
                    Ok(None) => {
                        tracing::debug!(provider = provider.name(), %query, "directory miss");
                        answered = true;
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(provider = provider.name(), %query, attempt, error = %e, "directory call failed");
                        let retryable = e.is_retryable();
                        last_error = Some(e);
                        if !retryable {
                            break;
                        }
                    }
                }
            }
        }

        if answered {
            return DirectoryOutcome::NotFound;
        }
        let unavailable = DirectoryUnavailable {
            providers: self.providers.len(),
            attempts,
            last_error: last_error.map(|e| e.to_string()),
        };
        tracing::warn!(%query, error = %unavailable, "directory unavailable");
        DirectoryOutcome::Unavailable(unavailable)
    }

    /// Runs one provider call on a helper thread and waits at most
    /// `call_timeout` for it. A call that overruns is abandoned; its result
    /// is dropped when it eventually arrives.
    fn call(
        &self,
        provider: &Arc<dyn DirectoryProvider>,
        query: &Query,
    ) -> Result<Option<DirectoryProfile>, ProviderError> {
        let (tx, rx) = bounded(1);
        let worker = Arc::clone(provider);
        let job = query.clone();
        thread::Builder::new()
            .name(format!("namesake-directory-{}", provider.name()))
            .spawn(move || {
                let _ = tx.send(job.run(worker.as_ref()));
            })
            .map_err(|e| ProviderError::Transport {
                provider: provider.name().to_string(),
                message: format!("failed to spawn directory call: {e}"),
            })?;

        match rx.recv_timeout(self.call_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ProviderError::Timeout {
                provider: provider.name().to_string(),
                timeout_ms: u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(ProviderError::Transport {
                provider: provider.name().to_string(),
                message: "provider call panicked".to_string(),
            }),
        }
    }
}
