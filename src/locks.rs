//! Per-identity mutual exclusion.
//!
//! Resolution and migration for one identity are serialized; different
//! identities proceed in parallel. Directory calls happen before the guard is
//! taken; the guard covers re-reading the stored identity and the write that
//! follows, so two resolvers racing on the same rename rewrite rows exactly
//! once.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::identity::IdentityKey;

/// Set of identities currently being worked on.
#[derive(Debug, Default)]
pub struct IdentityLocks {
    held: Mutex<HashSet<IdentityKey>>,
    released: Condvar,
}

impl IdentityLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<IdentityKey>> {
        // The set is only inserted into or removed from; a panic cannot
        // leave it half-updated.
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until `key` is free, then holds it until the guard drops.
    ///
    /// Not reentrant: locking a key already held by the calling thread
    /// deadlocks.
    pub fn lock(&self, key: IdentityKey) -> IdentityGuard<'_> {
        let mut held = self.held();
        while held.contains(&key) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(key);
        IdentityGuard { locks: self, key }
    }

    /// Holds `key` if it is free.
    pub fn try_lock(&self, key: IdentityKey) -> Option<IdentityGuard<'_>> {
        let mut held = self.held();
        held.insert(key).then_some(IdentityGuard { locks: self, key })
    }

    /// Returns true if some guard currently holds `key`.
    #[must_use]
    pub fn is_locked(&self, key: IdentityKey) -> bool {
        self.held().contains(&key)
    }
}

/// Proof that the current thread holds an identity lock.
#[derive(Debug)]
#[must_use = "the identity is unlocked as soon as the guard is dropped"]
pub struct IdentityGuard<'a> {
    locks: &'a IdentityLocks,
    key: IdentityKey,
}

impl IdentityGuard<'_> {
    /// The locked identity.
    #[must_use]
    pub const fn key(&self) -> IdentityKey {
        self.key
    }
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        self.locks.held().remove(&self.key);
        self.locks.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn guard_releases_on_drop() {
        let locks = IdentityLocks::new();
        let key = IdentityKey::random();
        {
            let guard = locks.lock(key);
            assert_eq!(guard.key(), key);
            assert!(locks.is_locked(key));
            assert!(locks.try_lock(key).is_none());
        }
        assert!(!locks.is_locked(key));
        assert!(locks.try_lock(key).is_some());
    }

    #[test]
    fn distinct_keys_do_not_block() {
        let locks = IdentityLocks::new();
        let _a = locks.lock(IdentityKey::random());
        let _b = locks.lock(IdentityKey::random());
    }

    #[test]
    fn same_key_is_serialized() {
        let locks = Arc::new(IdentityLocks::new());
        let key = IdentityKey::random();
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let _guard = locks.lock(key);
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
