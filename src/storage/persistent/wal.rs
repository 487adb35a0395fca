//! Write-ahead log for crash recovery.
//!
//! Every mutation is appended (and optionally fsynced) before it is applied
//! in memory. On open, the log is scanned; a torn or corrupt tail left by a
//! crash is cut off so later appends start from a clean frame boundary.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-framed WalEntry]
//! [ENTRY 2: codec-framed WalEntry]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::record::{EntityRecord, EntityType, RecordId};

use super::codec;

/// A single log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonic sequence number, reset by truncation.
    pub sequence: u64,
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
    /// The mutation.
    pub kind: WalEntryKind,
}

/// Logged mutations. Replay treats them as upserts so replaying twice is harmless.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalEntryKind {
    /// Record inserted.
    Create {
        /// Collection.
        entity_type: EntityType,
        /// Inserted record.
        record: EntityRecord,
    },
    /// Record replaced by its post-update state.
    Update {
        /// Collection.
        entity_type: EntityType,
        /// Full record after the update.
        record: EntityRecord,
    },
    /// Record removed.
    Delete {
        /// Collection.
        entity_type: EntityType,
        /// Removed id.
        id: RecordId,
    },
    /// Collection emptied.
    Clear {
        /// Collection.
        entity_type: EntityType,
    },
    /// Every collection emptied.
    ClearAll,
    /// Everything up to this sequence is in the snapshot file.
    Checkpoint {
        /// Last sequence covered.
        up_to_sequence: u64,
    },
}

fn poisoned(context: &str) -> IoError {
    IoError::new(ErrorKind::Other, format!("poisoned lock: {context}"))
}

#[derive(Debug)]
struct WalWriter {
    file: BufWriter<File>,
    sequence: u64,
}

/// Append-only mutation log.
#[derive(Debug)]
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    sync_on_write: bool,
}

impl WriteAheadLog {
    /// Opens or creates a log file, cutting off any torn tail.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let len = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };

        let sequence = if len < codec::HEADER_LEN {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            codec::write_header(&mut file)?;
            file.sync_all()?;
            0
        } else {
            let scan = Self::scan(path)?;
            if scan.valid_len < len {
                warn!(
                    path = %path.display(),
                    kept = scan.valid_len,
                    dropped = len - scan.valid_len,
                    "discarding torn WAL tail"
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(scan.valid_len)?;
                file.sync_all()?;
            }
            scan.last_sequence
        };

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                file: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        })
    }

    /// Appends an entry and returns its sequence number.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut writer = self.writer.lock().map_err(|_| poisoned("wal.append"))?;
        let entry = WalEntry {
            sequence: writer.sequence + 1,
            timestamp: Utc::now(),
            kind,
        };
        let encoded = codec::encode(&entry)?;
        writer.file.write_all(&encoded)?;
        writer.file.flush()?;
        if self.sync_on_write {
            writer.file.get_ref().sync_all()?;
        }
        writer.sequence = entry.sequence;
        Ok(entry.sequence)
    }

    /// Iterates over every entry. Stops quietly at a torn final frame.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Sequence number of the last appended entry.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.writer.lock().map_err(|_| poisoned("wal.sequence"))?.sequence)
    }

    /// File size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Empties the log after its contents reached a snapshot.
    pub fn truncate(&self) -> IoResult<()> {
        let mut writer = self.writer.lock().map_err(|_| poisoned("wal.truncate"))?;
        writer.file.flush()?;

        let mut file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        codec::write_header(&mut file)?;
        file.sync_all()?;

        writer.file = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        writer.sequence = 0;
        Ok(())
    }

    fn scan(path: &Path) -> IoResult<Scan> {
        let mut iter = WalIterator::new(path)?;
        let mut scan = Scan {
            last_sequence: 0,
            valid_len: codec::HEADER_LEN,
        };
        while let Some(entry) = iter.next() {
            match entry {
                Ok(entry) => {
                    scan.last_sequence = entry.sequence;
                    scan.valid_len = iter.position()?;
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        after_sequence = scan.last_sequence,
                        error = %e,
                        "WAL corruption detected"
                    );
                    break;
                }
            }
        }
        Ok(scan)
    }
}

struct Scan {
    last_sequence: u64,
    valid_len: u64,
}

/// Iterator over log entries.
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
    use tempfile::tempdir;

    fn create(id: &str) -> WalEntryKind {
        WalEntryKind::Create {
            entity_type: EntityType::Clients,
            record: EntityRecord::with_id(id),
        }
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.wal");
        {
            let wal = WriteAheadLog::open(&path, false).unwrap();
            wal.append(create("c1")).unwrap();
            wal.append(WalEntryKind::Delete {
                entity_type: EntityType::Clients,
                id: "c1".into(),
            })
            .unwrap();
            assert_eq!(wal.current_sequence().unwrap(), 2);
        }

        let wal = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);
        let entries: Vec<WalEntry> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[1].kind, WalEntryKind::Delete { .. }));
    }

    #[test]
    fn test_torn_tail_is_cut_off() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.wal");
        {
            let wal = WriteAheadLog::open(&path, true).unwrap();
            wal.append(create("c1")).unwrap();
            wal.append(create("c2")).unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();
        drop(file);

        let wal = WriteAheadLog::open(&path, true).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 1);
        wal.append(create("c3")).unwrap();
        drop(wal);

        let wal = WriteAheadLog::open(&path, true).unwrap();
        let entries: Vec<WalEntry> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence, 2);
    }

    #[test]
    fn test_truncate_resets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.wal");
        let wal = WriteAheadLog::open(&path, false).unwrap();
        wal.append(create("c1")).unwrap();
        wal.truncate().unwrap();

        assert_eq!(wal.current_sequence().unwrap(), 0);
        assert_eq!(wal.size_bytes().unwrap(), codec::HEADER_LEN);
        assert_eq!(wal.iter().unwrap().count(), 0);
    }
}
