//! Durable storage for namesake.
//!
//! This module provides crash-safe persistence for a
//! [`ConsistencyStore`]:
//! - a write-ahead log holding one frame per committed transaction
//! - CRC32 checksums for corruption detection
//! - a directory file lock for single-process access
//! - snapshot checkpoints so the log does not grow without bound
//!
//! # Layout
//!
//! ```text
//! <dir>/
//!   namesake.lock          exclusive lock, holder pid
//!   namesake.wal           [MAGIC][VERSION][Open][Commit]...
//!   snapshots/
//!     snapshot_00007.snap  [MAGIC][VERSION][SnapshotHeader][StoreSnapshot]
//! ```

mod codec;
mod file_lock;
mod journal;
mod snapshot;
mod wal;

pub use file_lock::FileLock;
pub use journal::PersistentJournal;
pub use snapshot::{SnapshotFile, SnapshotHeader, SnapshotManager};
pub use wal::{WalEntry, WalEntryKind, WalIterator, WriteAheadLog};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::PersistentConfig;
use crate::storage::{CheckpointReport, ConsistencyStore, StorageError, StoreState};

/// WAL file name inside the database directory.
pub const WAL_FILE: &str = "namesake.wal";

/// Snapshot directory name inside the database directory.
pub const SNAPSHOT_DIR: &str = "snapshots";

/// An open database: the store plus a handle on its journal.
pub struct PersistentDatabase {
    dir: PathBuf,
    store: Arc<ConsistencyStore>,
    journal: Arc<PersistentJournal>,
    replayed: usize,
}

impl std::fmt::Debug for PersistentDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentDatabase")
            .field("dir", &self.dir)
            .field("replayed", &self.replayed)
            .finish_non_exhaustive()
    }
}

impl PersistentDatabase {
    /// The shared store.
    #[must_use]
    pub fn store(&self) -> Arc<ConsistencyStore> {
        Arc::clone(&self.store)
    }

    /// The database directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of WAL batches replayed when the database was opened.
    #[must_use]
    pub const fn replayed(&self) -> usize {
        self.replayed
    }

    /// Current WAL size in bytes.
    #[must_use]
    pub fn wal_size(&self) -> u64 {
        self.journal.wal_size()
    }

    /// Number of snapshot files on disk.
    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        self.journal.snapshot_count()
    }

    /// Folds the WAL into a new snapshot.
    ///
    /// This operation:
    /// 1. Snapshots the store under its write lock
    /// 2. Writes the snapshot atomically
    /// 3. Writes a checkpoint marker to the WAL
    /// 4. Truncates the WAL
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written. The WAL is left
    /// intact in that case.
    pub fn compact(&self) -> Result<CheckpointReport, StorageError> {
        self.store.checkpoint()
    }
}

/// Opens or creates a database at `path`.
///
/// Loads the newest snapshot, then replays WAL batches it does not cover.
///
/// # Errors
///
/// - the directory cannot be created or accessed
/// - another process holds the lock
/// - the snapshot or a complete WAL frame is corrupted
///
/// # Example
///
/// ```rust,no_run
/// use namesake::config::PersistentConfig;
/// use namesake::storage::persistent::open_database;
///
/// let db = open_database("./namesake.db", &PersistentConfig::default())?;
/// let store = db.store();
/// store.register_table("general_stats")?;
/// # Ok::<(), namesake::storage::StorageError>(())
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: &PersistentConfig,
) -> Result<PersistentDatabase, StorageError> {
    let config = config
        .clone()
        .validate()
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let dir = path.as_ref();

    fs::create_dir_all(dir)
        .map_err(|e| StorageError::Journal(format!("failed to create database directory: {e}")))?;
    let lock = FileLock::acquire(dir)
        .map_err(|e| StorageError::Backend(format!("failed to acquire lock: {e}")))?;

    let snapshots = SnapshotManager::open(&dir.join(SNAPSHOT_DIR))?;
    let (mut state, covered) = match snapshots.load_latest()? {
        Some((header, snapshot)) => (StoreState::from_snapshot(snapshot)?, Some(header)),
        None => (StoreState::default(), None),
    };

    let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)?;
    let epoch = wal.epoch()?;
    let mut replayed = 0;
    for entry in wal.iter()? {
        let entry = entry?;
        let WalEntryKind::Commit(batch) = entry.kind else {
            continue;
        };
        if covered.as_ref().is_some_and(|h| h.covers(epoch, entry.sequence)) {
            continue;
        }
        state.replay(&batch)?;
        replayed += 1;
    }
    if replayed > 0 {
        tracing::info!(dir = %dir.display(), replayed, "replayed WAL batches");
    }

    let journal = Arc::new(PersistentJournal::new(wal, snapshots, config, lock));
    let store = Arc::new(ConsistencyStore::with_journal(
        Box::new(Arc::clone(&journal)),
        state,
    ));

    Ok(PersistentDatabase {
        dir: dir.to_path_buf(),
        store,
        journal,
        replayed,
    })
}
