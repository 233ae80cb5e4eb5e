//! WAL-backed journal with snapshot checkpoints.

use std::sync::Mutex;

use chrono::Utc;

use crate::config::PersistentConfig;
use crate::storage::{CheckpointReport, CommitBatch, Journal, StorageError, StoreSnapshot};

use super::file_lock::FileLock;
use super::snapshot::{SnapshotHeader, SnapshotManager};
use super::wal::{WalEntryKind, WriteAheadLog};

/// Journal that makes every committed batch durable before it is visible.
#[derive(Debug)]
pub struct PersistentJournal {
    wal: WriteAheadLog,
    snapshots: Mutex<SnapshotManager>,
    config: PersistentConfig,
    _lock: FileLock,
}

impl PersistentJournal {
    pub(super) fn new(
        wal: WriteAheadLog,
        snapshots: SnapshotManager,
        config: PersistentConfig,
        lock: FileLock,
    ) -> Self {
        Self {
            wal,
            snapshots: Mutex::new(snapshots),
            config,
            _lock: lock,
        }
    }

    /// Current WAL size in bytes.
    #[must_use]
    pub fn wal_size(&self) -> u64 {
        self.wal.size_bytes().unwrap_or(0)
    }

    /// Number of snapshot files on disk.
    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().map_or(0, |s| s.snapshots().len())
    }
}

impl Journal for PersistentJournal {
    fn commit(&self, batch: &CommitBatch) -> Result<(), StorageError> {
        let sequence = self.wal.append_commit(batch)?;
        tracing::trace!(sequence, mutations = batch.mutations.len(), "WAL commit");
        Ok(())
    }

    fn wants_checkpoint(&self) -> bool {
        self.wal_size() >= self.config.max_wal_size
    }

    /// Writes the snapshot, marks the WAL, then starts a new WAL generation.
    ///
    /// Safe to interrupt at any point: until the WAL is truncated its
    /// entries are either replayed or recognized as covered by the snapshot.
    fn checkpoint(&self, snapshot: &StoreSnapshot) -> Result<CheckpointReport, StorageError> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|_| StorageError::Backend("poisoned lock: snapshots".to_string()))?;

        let wal_size_before = self.wal.size_bytes()?;
        let up_to_sequence = self.wal.current_sequence()?;
        let header = SnapshotHeader {
            wal_epoch: self.wal.epoch()?,
            up_to_sequence,
            created_at: Utc::now(),
        };

        let file = snapshots.write(header, snapshot)?;
        self.wal.append(WalEntryKind::Checkpoint { up_to_sequence })?;
        self.wal.truncate()?;

        let pruned = snapshots.prune(self.config.retain_snapshots)?;
        let wal_size_after = self.wal.size_bytes()?;
        tracing::info!(
            snapshot = %file.path.display(),
            entries = up_to_sequence,
            wal_size_before,
            wal_size_after,
            pruned,
            "checkpoint complete"
        );

        Ok(CheckpointReport {
            entries_compacted: up_to_sequence,
            snapshot_path: Some(file.path),
            wal_size_before,
            wal_size_after,
        })
    }
}
