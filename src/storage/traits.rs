//! Storage seams for namesake.
//!
//! The [`ConsistencyStore`](super::ConsistencyStore) keeps the authoritative
//! state in memory and hands one redo batch per committed transaction to a
//! [`Journal`]. Journals decide how (and whether) batches survive a restart:
//! - [`MemoryJournal`](super::MemoryJournal) for tests and embedding
//! - `PersistentJournal` (feature `persistent`) for a WAL plus snapshots

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::identity::IdentityKey;

use super::state::{CommitBatch, StoreSnapshot};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend error (including poisoned locks).
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// The name is already the active name of another identity.
    #[error("Name '{name}' is already active for identity {holder}")]
    NameConflict {
        name: String,
        holder: IdentityKey,
    },

    /// The dependent table was never registered.
    #[error("Unknown dependent table: {0}")]
    UnknownTable(String),

    /// The journal could not durably record a batch.
    #[error("Journal I/O error: {0}")]
    Journal(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// On-disk state failed an integrity check.
    #[error("Corrupted storage: {0}")]
    Corrupted(String),
}

impl StorageError {
    /// Returns true if the same operation may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Journal(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::InvalidData {
            Self::Corrupted(e.to_string())
        } else {
            Self::Journal(e.to_string())
        }
    }
}

/// Outcome of folding the journal into a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointReport {
    /// Number of journal entries covered by the snapshot.
    pub entries_compacted: u64,
    /// Snapshot file written, if any.
    pub snapshot_path: Option<PathBuf>,
    /// Journal size before the checkpoint.
    pub wal_size_before: u64,
    /// Journal size after the checkpoint.
    pub wal_size_after: u64,
}

/// Durability backend for committed transactions.
///
/// Called with the store's write lock held, so implementations see batches
/// in commit order and never concurrently.
pub trait Journal: Send + Sync {
    /// Durably records a committed batch.
    ///
    /// An error makes the store roll the transaction back; the batch must
    /// then not be replayed on recovery.
    fn commit(&self, batch: &CommitBatch) -> Result<(), StorageError>;

    /// Returns true once the journal would like to be folded into a snapshot.
    fn wants_checkpoint(&self) -> bool {
        false
    }

    /// Writes `snapshot` and discards the journal entries it covers.
    fn checkpoint(&self, _snapshot: &StoreSnapshot) -> Result<CheckpointReport, StorageError> {
        Ok(CheckpointReport::default())
    }
}

impl<J: Journal + ?Sized> Journal for Arc<J> {
    fn commit(&self, batch: &CommitBatch) -> Result<(), StorageError> {
        (**self).commit(batch)
    }

    fn wants_checkpoint(&self) -> bool {
        (**self).wants_checkpoint()
    }

    fn checkpoint(&self, snapshot: &StoreSnapshot) -> Result<CheckpointReport, StorageError> {
        (**self).checkpoint(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure the journal trait is object-safe
    fn _assert_journal_object_safe(_: &dyn Journal) {}

    #[test]
    fn test_storage_error_display() {
        let holder = IdentityKey::random();
        let err = StorageError::NameConflict {
            name: "Jyyroh".to_string(),
            holder,
        };
        assert!(err.to_string().contains("Jyyroh"));
        assert!(err.to_string().contains(&holder.to_string()));

        let err = StorageError::Backend("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::Journal("disk full".into()).is_transient());
        assert!(StorageError::Backend("poisoned lock".into()).is_transient());
        assert!(!StorageError::UnknownTable("x".into()).is_transient());
        assert!(!StorageError::Corrupted("crc".into()).is_transient());
    }

    #[test]
    fn test_io_error_mapping() {
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, "CRC mismatch");
        assert!(matches!(StorageError::from(io), StorageError::Corrupted(_)));

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(StorageError::from(io), StorageError::Journal(_)));
    }
}
