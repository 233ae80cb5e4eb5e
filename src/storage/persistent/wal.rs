//! Write-ahead log of committed transaction batches.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [FRAME 0: WalEntry { kind: Open { epoch } }]
//! [FRAME 1: WalEntry { kind: Commit(batch) }]
//! ...
//! ```
//!
//! Every log generation starts with an `Open` frame carrying a fresh epoch.
//! Snapshots record the epoch and sequence they cover, which is how recovery
//! tells a log that was already folded into a snapshot from a newer one.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Result as IoResult, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::CommitBatch;

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Position within the current log generation; `Open` is 0.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The logged record.
    pub kind: WalEntryKind,
}

/// The type of WAL entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// Starts a log generation.
    Open { epoch: Uuid },
    /// One committed transaction.
    Commit(CommitBatch),
    /// Everything up to `up_to_sequence` is in a snapshot.
    Checkpoint { up_to_sequence: u64 },
}

struct WalInner {
    file: File,
    sequence: u64,
    epoch: Uuid,
    len: u64,
}

/// Write-ahead log.
///
/// Thread-safe via internal mutex; the store additionally serializes all
/// writers behind its own lock.
pub struct WriteAheadLog {
    path: PathBuf,
    inner: Mutex<WalInner>,
    sync_on_write: bool,
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

fn poisoned() -> std::io::Error {
    std::io::Error::new(ErrorKind::Other, "poisoned lock: wal")
}

impl WriteAheadLog {
    /// Opens or creates the log at `path`.
    ///
    /// An existing log is scanned to find its epoch and last sequence. A
    /// frame cut short by a crash is truncated away so that later appends
    /// never land behind garbage; the transaction it held was never
    /// acknowledged.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if a complete frame fails its checksum.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let inner = if file.metadata()?.len() < codec::HEADER_LEN {
            Self::start_generation(file, sync_on_write)?
        } else {
            Self::recover(path, file, sync_on_write)?
        };

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(inner),
            sync_on_write,
        })
    }

    fn start_generation(mut file: File, sync_on_write: bool) -> IoResult<WalInner> {
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        codec::write_header(&mut file)?;

        let epoch = Uuid::new_v4();
        let frame = codec::encode(&WalEntry {
            sequence: 0,
            timestamp: Utc::now(),
            kind: WalEntryKind::Open { epoch },
        })?;
        file.write_all(&frame)?;
        if sync_on_write {
            file.sync_all()?;
        }

        Ok(WalInner {
            file,
            sequence: 0,
            epoch,
            len: codec::HEADER_LEN + frame.len() as u64,
        })
    }

    fn recover(path: &Path, mut file: File, sync_on_write: bool) -> IoResult<WalInner> {
        let mut epoch = None;
        let mut sequence = 0;
        let mut valid_len = codec::HEADER_LEN;

        let mut iter = WalIterator::new(path)?;
        while let Some(entry) = iter.next() {
            let entry = entry?;
            match entry.kind {
                WalEntryKind::Open { epoch: e } => epoch = Some(e),
                WalEntryKind::Commit(_) | WalEntryKind::Checkpoint { .. } => {}
            }
            sequence = entry.sequence;
            valid_len = iter.position()?;
        }

        let Some(epoch) = epoch else {
            // Crashed between writing the header and the Open frame.
            return Self::start_generation(file, sync_on_write);
        };

        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = on_disk - valid_len,
                last_sequence = sequence,
                "WAL: discarding torn tail frame"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(WalInner {
            file,
            sequence,
            epoch,
            len: valid_len,
        })
    }

    fn lock(&self) -> IoResult<MutexGuard<'_, WalInner>> {
        self.inner.lock().map_err(|_| poisoned())
    }

    /// Appends a committed batch, returning its sequence number.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors. A failed append leaves the log as it was.
    pub fn append_commit(&self, batch: &CommitBatch) -> IoResult<u64> {
        self.append(WalEntryKind::Commit(batch.clone()))
    }

    /// Appends an entry, returning its sequence number.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors. A failed append leaves the log as it was.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut inner = self.lock()?;
        let candidate = inner.sequence + 1;
        let frame = codec::encode(&WalEntry {
            sequence: candidate,
            timestamp: Utc::now(),
            kind,
        })?;

        let written = inner.file.write_all(&frame).and_then(|()| {
            if self.sync_on_write {
                inner.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            let len = inner.len;
            if let Err(trunc) = inner.file.set_len(len) {
                tracing::error!(error = %trunc, "WAL: failed to trim partial frame");
            }
            return Err(e);
        }

        inner.sequence = candidate;
        inner.len += frame.len() as u64;
        Ok(candidate)
    }

    /// Iterates over all entries in the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or its header is bad.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Sequence of the last appended entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.lock()?.sequence)
    }

    /// Epoch of the current log generation.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn epoch(&self) -> IoResult<Uuid> {
        Ok(self.lock()?.epoch)
    }

    /// Log size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(self.lock()?.len)
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Discards every entry and starts a new generation with a new epoch.
    ///
    /// Only call this after the current state is durably in a snapshot.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors.
    pub fn truncate(&self) -> IoResult<()> {
        let mut inner = self.lock()?;
        let file = inner.file.try_clone()?;
        *inner = Self::start_generation(file, true)?;
        Ok(())
    }
}

/// Iterator over WAL entries.
///
/// Stops quietly at a frame cut short by a crash.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        Ok(Self { reader, file_size })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }

        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Mutation;
    use tempfile::tempdir;

    fn batch(table: &str) -> CommitBatch {
        CommitBatch {
            mutations: vec![Mutation::RegisterTable {
                table: table.to_string(),
            }],
        }
    }

    fn commits(wal: &WriteAheadLog) -> Vec<u64> {
        wal.iter()
            .unwrap()
            .map(Result::unwrap)
            .filter(|e| matches!(e.kind, WalEntryKind::Commit(_)))
            .map(|e| e.sequence)
            .collect()
    }

    #[test]
    fn test_wal_append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let epoch = {
            let wal = WriteAheadLog::open(&path, false).unwrap();
            assert_eq!(wal.append_commit(&batch("general_stats")).unwrap(), 1);
            assert_eq!(wal.append_commit(&batch("sheep_stats")).unwrap(), 2);
            wal.epoch().unwrap()
        };

        let wal = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);
        assert_eq!(wal.epoch().unwrap(), epoch);
        assert_eq!(commits(&wal), [1, 2]);
    }

    #[test]
    fn test_torn_tail_is_truncated_before_new_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.wal");

        {
            let wal = WriteAheadLog::open(&path, true).unwrap();
            wal.append_commit(&batch("ctw_stats")).unwrap();
        }
        let good_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            let frame = codec::encode(&WalEntry {
                sequence: 2,
                timestamp: Utc::now(),
                kind: WalEntryKind::Commit(batch("ww_stats")),
            })
            .unwrap();
            file.write_all(&frame[..frame.len() / 2]).unwrap();
        }

        let wal = WriteAheadLog::open(&path, true).unwrap();
        assert_eq!(wal.size_bytes().unwrap(), good_len);
        assert_eq!(wal.append_commit(&batch("ww_stats")).unwrap(), 2);
        drop(wal);

        let wal = WriteAheadLog::open(&path, true).unwrap();
        assert_eq!(commits(&wal), [1, 2]);
    }

    #[test]
    fn test_crc_corruption_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.wal");
        {
            let wal = WriteAheadLog::open(&path, true).unwrap();
            wal.append_commit(&batch("user_meta")).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 6;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = WriteAheadLog::open(&path, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncate_starts_new_generation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gen.wal");
        let wal = WriteAheadLog::open(&path, false).unwrap();
        wal.append_commit(&batch("user_links")).unwrap();
        let first = wal.epoch().unwrap();

        wal.truncate().unwrap();
        assert_ne!(wal.epoch().unwrap(), first);
        assert_eq!(wal.current_sequence().unwrap(), 0);
        assert!(commits(&wal).is_empty());

        assert_eq!(wal.append_commit(&batch("hotbar_layouts")).unwrap(), 1);
        assert_eq!(commits(&wal), [1]);
    }
}
