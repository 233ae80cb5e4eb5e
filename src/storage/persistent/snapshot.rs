//! Snapshot files: the whole store folded out of the WAL.
//!
//! # Design
//! - Snapshots are numbered sequentially (`snapshot_00001.snap`, ...)
//! - Each file is `[header][SnapshotHeader frame][StoreSnapshot frame]`
//! - Written to a temp file, fsynced, then atomically renamed into place
//! - Only the newest snapshot is loaded; older ones are pruned

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::StoreSnapshot;

use super::codec;

const EXTENSION: &str = "snap";
const PREFIX: &str = "snapshot_";

/// Which part of the WAL a snapshot already covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Epoch of the WAL generation the snapshot was cut from.
    pub wal_epoch: Uuid,
    /// Last WAL sequence folded into the snapshot.
    pub up_to_sequence: u64,
    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,
}

impl SnapshotHeader {
    /// Returns true if the WAL entry `(epoch, sequence)` is already included.
    #[must_use]
    pub fn covers(&self, epoch: Uuid, sequence: u64) -> bool {
        self.wal_epoch == epoch && sequence <= self.up_to_sequence
    }
}

/// A snapshot file on disk.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    /// File number.
    pub id: u32,
    /// File path.
    pub path: PathBuf,
}

impl SnapshotFile {
    /// Reads the header and the full store image.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if any frame fails its checksum.
    pub fn read(&self) -> IoResult<(SnapshotHeader, StoreSnapshot)> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        codec::read_header(&mut reader)?;
        let header: SnapshotHeader = codec::decode(&mut reader)?;
        let snapshot: StoreSnapshot = codec::decode(&mut reader)?;
        Ok((header, snapshot))
    }
}

/// Manages snapshot files in one directory.
#[derive(Debug)]
pub struct SnapshotManager {
    dir: PathBuf,
    snapshots: Vec<SnapshotFile>,
    next_id: u32,
}

impl SnapshotManager {
    /// Opens (creating if needed) the snapshot directory.
    ///
    /// Leftover temp files from an interrupted write are removed.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors.
    pub fn open(dir: &Path) -> IoResult<Self> {
        fs::create_dir_all(dir)?;

        let mut snapshots = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "tmp") {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove stale snapshot temp file");
                }
                continue;
            }
            if !path.extension().is_some_and(|e| e == EXTENSION) {
                continue;
            }
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix(PREFIX))
                .and_then(|s| s.parse::<u32>().ok());
            if let Some(id) = id {
                snapshots.push(SnapshotFile { id, path });
            }
        }
        snapshots.sort_by_key(|s| s.id);
        let next_id = snapshots.last().map_or(1, |s| s.id + 1);

        Ok(Self {
            dir: dir.to_path_buf(),
            snapshots,
            next_id,
        })
    }

    /// Snapshot files, oldest first.
    #[must_use]
    pub fn snapshots(&self) -> &[SnapshotFile] {
        &self.snapshots
    }

    /// The newest snapshot, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&SnapshotFile> {
        self.snapshots.last()
    }

    /// Reads the newest snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the newest snapshot is unreadable. Older
    /// snapshots are not a substitute: the WAL they pair with is gone.
    pub fn load_latest(&self) -> IoResult<Option<(SnapshotHeader, StoreSnapshot)>> {
        self.latest().map(SnapshotFile::read).transpose()
    }

    /// Durably writes a new snapshot.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors; the temp file is removed on failure.
    pub fn write(&mut self, header: SnapshotHeader, snapshot: &StoreSnapshot) -> IoResult<SnapshotFile> {
        let id = self.next_id;
        let final_path = self.dir.join(format!("{PREFIX}{id:05}.{EXTENSION}"));
        let temp_path = self.dir.join(format!("{PREFIX}{id:05}.{}.tmp", Uuid::new_v4().simple()));

        let written = Self::write_temp(&temp_path, &header, snapshot)
            .and_then(|()| fs::rename(&temp_path, &final_path));
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        Self::sync_dir(&self.dir);

        self.next_id += 1;
        let file = SnapshotFile { id, path: final_path };
        self.snapshots.push(file.clone());
        Ok(file)
    }

    fn write_temp(path: &Path, header: &SnapshotHeader, snapshot: &StoreSnapshot) -> IoResult<()> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer)?;
        writer.write_all(&codec::encode(header)?)?;
        writer.write_all(&codec::encode(snapshot)?)?;
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    #[cfg(unix)]
    fn sync_dir(dir: &Path) {
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            tracing::debug!(dir = %dir.display(), error = %e, "directory fsync failed");
        }
    }

    #[cfg(not(unix))]
    fn sync_dir(_dir: &Path) {}

    /// Deletes all but the newest `retain` snapshots.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors.
    pub fn prune(&mut self, retain: usize) -> IoResult<usize> {
        let retain = retain.max(1);
        if self.snapshots.len() <= retain {
            return Ok(0);
        }
        let excess = self.snapshots.len() - retain;
        for old in self.snapshots.drain(..excess) {
            fs::remove_file(&old.path)?;
        }
        Ok(excess)
    }
}
