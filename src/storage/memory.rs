//! In-memory journal.
//!
//! Accepts every batch and keeps nothing. Intended for embedded usage,
//! tests, and as a reference implementation of [`Journal`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::state::CommitBatch;
use super::traits::{Journal, StorageError};

/// A journal without durability.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    commits: Arc<AtomicU64>,
}

impl MemoryJournal {
    /// Creates a new journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counter of committed batches.
    #[must_use]
    pub fn commit_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.commits)
    }
}

impl Journal for MemoryJournal {
    fn commit(&self, batch: &CommitBatch) -> Result<(), StorageError> {
        tracing::trace!(mutations = batch.mutations.len(), "memory journal commit");
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_commits() {
        let journal = MemoryJournal::new();
        let counter = journal.commit_counter();
        journal.commit(&CommitBatch::default()).unwrap();
        journal.commit(&CommitBatch::default()).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        assert!(!journal.wants_checkpoint());
    }
}
