//! Durable structured backend: snapshot plus write-ahead log.

use std::fs;
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, info, warn};

use crate::record::{EntityRecord, EntityType, Fields, RecordId};
use crate::storage::memory::lock_err;
use crate::storage::traits::{BulkOutcome, StorageBackend, StorageError};

use super::file_lock::FileLock;
use super::snapshot::{self, Collections};
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "records.wal";
const SNAPSHOT_FILE: &str = "snapshot.dat";

fn io_err(context: &str, e: &IoError) -> StorageError {
    let message = format!("{context}: {e}");
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::TimedOut => StorageError::Busy(message),
        ErrorKind::InvalidData | ErrorKind::UnexpectedEof => StorageError::Corrupt(message),
        _ => StorageError::Backend(message),
    }
}

/// Applies a logged mutation. Idempotent, so replaying an entry twice is harmless.
fn apply(collections: &mut Collections, kind: WalEntryKind) {
    match kind {
        WalEntryKind::Create { entity_type, record } | WalEntryKind::Update { entity_type, record } => {
            if let Some(id) = record.id {
                collections.entry(entity_type).or_default().insert(id, record.fields);
            }
        }
        WalEntryKind::Delete { entity_type, id } => {
            if let Some(collection) = collections.get_mut(&entity_type) {
                collection.remove(&id);
                if collection.is_empty() {
                    collections.remove(&entity_type);
                }
            }
        }
        WalEntryKind::Clear { entity_type } => {
            collections.remove(&entity_type);
        }
        WalEntryKind::ClearAll => collections.clear(),
        WalEntryKind::Checkpoint { .. } => {}
    }
}

/// Result of a compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    /// Records written to the snapshot.
    pub records: usize,
    /// WAL size before compaction.
    pub wal_size_before: u64,
    /// WAL size after compaction.
    pub wal_size_after: u64,
}

/// A [`StorageBackend`] persisted in a directory.
///
/// The whole store is held in memory. Mutations are logged before they are
/// applied; the log is folded into the snapshot once it outgrows
/// `max_wal_size`.
#[derive(Debug)]
pub struct PersistentBackend {
    dir: PathBuf,
    _lock: FileLock,
    wal: WriteAheadLog,
    state: RwLock<Collections>,
    config: PersistentConfig,
}

impl PersistentBackend {
    /// Opens or creates a store in `dir`, replaying the log over the snapshot.
    ///
    /// # Errors
    /// - `Busy` if another process holds the store
    /// - `Corrupt` if the snapshot cannot be decoded
    /// - `Backend` for other I/O failures
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| io_err("create store directory", &e))?;
        let lock = FileLock::acquire(dir).map_err(|e| io_err("acquire store lock", &e))?;

        let mut collections =
            snapshot::load(&dir.join(SNAPSHOT_FILE)).map_err(|e| io_err("load snapshot", &e))?;
        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| io_err("open WAL", &e))?;

        let mut replayed = 0usize;
        for entry in wal.iter().map_err(|e| io_err("read WAL", &e))? {
            let entry = entry.map_err(|e| io_err("replay WAL", &e))?;
            apply(&mut collections, entry.kind);
            replayed += 1;
        }
        if replayed > 0 {
            info!(dir = %dir.display(), entries = replayed, "replayed WAL");
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            state: RwLock::new(collections),
            config,
        })
    }

    /// Store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current WAL size in bytes.
    pub fn wal_size(&self) -> Result<u64, StorageError> {
        self.wal.size_bytes().map_err(|e| io_err("stat WAL", &e))
    }

    /// Folds the log into a fresh snapshot and empties it.
    ///
    /// Safe to interrupt: until the log is truncated, replay reproduces the
    /// same state on top of either snapshot.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let state = self.state.write().map_err(|_| lock_err("persistent.compact"))?;
        let wal_size_before = self.wal_size()?;
        let records = snapshot::write(&self.dir.join(SNAPSHOT_FILE), &state)
            .map_err(|e| io_err("write snapshot", &e))?;
        let up_to_sequence = self
            .wal
            .current_sequence()
            .map_err(|e| io_err("read WAL sequence", &e))?;
        self.wal
            .append(WalEntryKind::Checkpoint { up_to_sequence })
            .map_err(|e| io_err("write checkpoint", &e))?;
        self.wal.truncate().map_err(|e| io_err("truncate WAL", &e))?;
        drop(state);

        let result = CompactionResult {
            records,
            wal_size_before,
            wal_size_after: self.wal_size()?,
        };
        debug!(?result, "compacted store");
        Ok(result)
    }

    fn log(&self, kind: WalEntryKind) -> Result<(), StorageError> {
        self.wal
            .append(kind)
            .map(|_| ())
            .map_err(|e| io_err("append WAL", &e))
    }

    fn maybe_compact(&self) {
        match self.wal_size() {
            Ok(size) if size > self.config.max_wal_size => {
                if let Err(e) = self.compact() {
                    warn!(error = %e, "compaction failed; WAL keeps growing");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not stat WAL"),
        }
    }

    fn insert_logged(
        &self,
        collections: &mut Collections,
        entity_type: &EntityType,
        record: EntityRecord,
    ) -> Result<EntityRecord, StorageError> {
        let id = record
            .id
            .clone()
            .ok_or_else(|| StorageError::MissingId(entity_type.clone()))?;
        if collections.get(entity_type).is_some_and(|c| c.contains_key(&id)) {
            return Err(StorageError::duplicate(entity_type, &id));
        }
        self.log(WalEntryKind::Create {
            entity_type: entity_type.clone(),
            record: record.clone(),
        })?;
        collections
            .entry(entity_type.clone())
            .or_default()
            .insert(id, record.fields.clone());
        Ok(record)
    }
}

impl StorageBackend for PersistentBackend {
    fn name(&self) -> &str {
        "persistent"
    }

    fn get_all(&self, entity_type: &EntityType) -> Result<Vec<EntityRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("persistent.get_all"))?;
        Ok(state
            .get(entity_type)
            .map(|c| {
                c.iter()
                    .map(|(id, fields)| EntityRecord {
                        id: Some(id.clone()),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_by_id(&self, entity_type: &EntityType, id: &RecordId) -> Result<EntityRecord, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("persistent.get_by_id"))?;
        state
            .get(entity_type)
            .and_then(|c| c.get(id))
            .map(|fields| EntityRecord {
                id: Some(id.clone()),
                fields: fields.clone(),
            })
            .ok_or_else(|| StorageError::not_found(entity_type, id))
    }

    fn create(&self, entity_type: &EntityType, record: EntityRecord) -> Result<EntityRecord, StorageError> {
        let created = {
            let mut state = self.state.write().map_err(|_| lock_err("persistent.create"))?;
            self.insert_logged(&mut state, entity_type, record)?
        };
        self.maybe_compact();
        Ok(created)
    }

    fn update(
        &self,
        entity_type: &EntityType,
        id: &RecordId,
        partial: Fields,
    ) -> Result<EntityRecord, StorageError> {
        let updated = {
            let mut state = self.state.write().map_err(|_| lock_err("persistent.update"))?;
            let fields = state
                .get_mut(entity_type)
                .and_then(|c| c.get_mut(id))
                .ok_or_else(|| StorageError::not_found(entity_type, id))?;
            let mut record = EntityRecord {
                id: Some(id.clone()),
                fields: fields.clone(),
            };
            record.merge_from(&partial);
            self.log(WalEntryKind::Update {
                entity_type: entity_type.clone(),
                record: record.clone(),
            })?;
            fields.clone_from(&record.fields);
            record
        };
        self.maybe_compact();
        Ok(updated)
    }

    fn delete(&self, entity_type: &EntityType, id: &RecordId) -> Result<(), StorageError> {
        {
            let mut state = self.state.write().map_err(|_| lock_err("persistent.delete"))?;
            if !state.get(entity_type).is_some_and(|c| c.contains_key(id)) {
                return Err(StorageError::not_found(entity_type, id));
            }
            let kind = WalEntryKind::Delete {
                entity_type: entity_type.clone(),
                id: id.clone(),
            };
            self.log(kind.clone())?;
            apply(&mut state, kind);
        }
        self.maybe_compact();
        Ok(())
    }

    fn bulk_create(&self, entity_type: &EntityType, records: Vec<EntityRecord>) -> BulkOutcome {
        let outcome = match self.state.write() {
            Ok(mut state) => records
                .into_iter()
                .map(|record| self.insert_logged(&mut state, entity_type, record))
                .collect(),
            Err(_) => records
                .iter()
                .map(|_| Err(lock_err("persistent.bulk_create")))
                .collect(),
        };
        self.maybe_compact();
        outcome
    }

    fn clear(&self, entity_type: &EntityType) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("persistent.clear"))?;
        let kind = WalEntryKind::Clear {
            entity_type: entity_type.clone(),
        };
        self.log(kind.clone())?;
        apply(&mut state, kind);
        Ok(())
    }

    fn clear_all(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("persistent.clear_all"))?;
        self.log(WalEntryKind::ClearAll)?;
        state.clear();
        Ok(())
    }

    fn entity_types(&self) -> Result<Vec<EntityType>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("persistent.entity_types"))?;
        Ok(state
            .iter()
            .filter(|(_, c)| !c.is_empty())
            .map(|(t, _)| t.clone())
            .collect())
    }

    fn count(&self, entity_type: &EntityType) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("persistent.count"))?;
        Ok(state.get(entity_type).map_or(0, |c| c.len()))
    }
}
