//! In-process directory provider.
//!
//! Holds a key → current name table and can simulate outages and latency.
//! Used by tests and by embedders that keep their own authority.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::error::ProviderError;
use crate::identity::{DisplayName, IdentityKey};

use super::{DirectoryProfile, DirectoryProvider};

#[derive(Debug, Default)]
struct Inner {
    names: HashMap<IdentityKey, DisplayName>,
    fail_next: u32,
    offline: bool,
    latency: Option<Duration>,
}

/// A directory backed by a map.
#[derive(Debug)]
pub struct MemoryDirectory {
    name: String,
    inner: Mutex<Inner>,
    calls: AtomicU64,
}

impl MemoryDirectory {
    /// Creates an empty directory called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
            calls: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        // No cross-field invariants; poisoning is ignored.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Sets the current name of `id`.
    pub fn insert(&self, id: IdentityKey, name: DisplayName) {
        self.state().names.insert(id, name);
    }

    /// Renames `id`, as the directory's owner would.
    pub fn rename(&self, id: IdentityKey, name: DisplayName) {
        self.insert(id, name);
    }

    /// Forgets `id`.
    pub fn remove(&self, id: IdentityKey) {
        self.state().names.remove(&id);
    }

    /// Makes the next `n` calls fail with a retryable transport error.
    pub fn fail_next(&self, n: u32) {
        self.state().fail_next = n;
    }

    /// Makes every call fail until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    /// Number of calls received.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = {
            let mut inner = self.state();
            if inner.offline || inner.fail_next > 0 {
                inner.fail_next = inner.fail_next.saturating_sub(1);
                return Err(ProviderError::Transport {
                    provider: self.name.clone(),
                    message: "simulated outage".to_string(),
                });
            }
            inner.latency
        };
        if let Some(latency) = latency {
            thread::sleep(latency);
        }
        Ok(())
    }
}

impl DirectoryProvider for MemoryDirectory {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, name: &str) -> Result<Option<DirectoryProfile>, ProviderError> {
        self.enter()?;
        Ok(self
            .state()
            .names
            .iter()
            .find(|(_, current)| current.eq_folded(name))
            .map(|(id, current)| DirectoryProfile::new(*id, current.clone())))
    }

    fn lookup_by_key(&self, key: IdentityKey) -> Result<Option<DirectoryProfile>, ProviderError> {
        self.enter()?;
        Ok(self
            .state()
            .names
            .get(&key)
            .map(|current| DirectoryProfile::new(key, current.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_are_case_insensitive() {
        let dir = MemoryDirectory::new("mem");
        let id = IdentityKey::random();
        dir.insert(id, DisplayName::new("DaJJay").unwrap());

        let profile = dir.lookup("DAJJAY").unwrap().unwrap();
        assert_eq!(profile.id, id);
        assert_eq!(profile.name.as_str(), "DaJJay");
        assert!(dir.lookup("someone").unwrap().is_none());

        dir.remove(id);
        assert!(dir.lookup_by_key(id).unwrap().is_none());
        assert_eq!(dir.calls(), 3);
    }

    #[test]
    fn fail_next_then_recovers() {
        let dir = MemoryDirectory::new("mem");
        dir.fail_next(1);
        let err = dir.lookup("x").unwrap_err();
        assert!(err.is_retryable());
        assert!(dir.lookup("x").unwrap().is_none());
    }
}
