//! Backup snapshots of the legacy store.
//!
//! A [`BackupSnapshot`] is an immutable, timestamped, complete copy of every
//! legacy collection. Snapshots are stored as records in the `_backups`
//! collection of a system backend, keyed by creation timestamp, and carry a
//! blake3 checksum that is verified before any restore. They are retained
//! until the operator discards them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::record::{EntityRecord, EntityType, Fields, RecordId};
use crate::storage::{StorageBackend, StorageError};

/// Collection holding backup blobs.
pub const BACKUP_COLLECTION: &str = "_backups";

/// Backup identifier: the creation timestamp in a lexically sortable form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupId(String);

impl BackupId {
    fn from_timestamp(at: DateTime<Utc>) -> Self {
        Self(at.format("%Y%m%dT%H%M%S%.9fZ").to_string())
    }

    /// Wraps an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable copy of the legacy store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    /// Identifier (creation timestamp).
    pub id: BackupId,
    /// When the copy was taken.
    pub created_at: DateTime<Utc>,
    /// Every record, per entity type, in backend order.
    pub collections: BTreeMap<EntityType, Vec<EntityRecord>>,
    /// Hex blake3 digest of `collections`.
    pub checksum: String,
}

impl BackupSnapshot {
    /// Total records across collections.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    /// Records captured for one entity type.
    #[must_use]
    pub fn records(&self, entity_type: &EntityType) -> &[EntityRecord] {
        self.collections.get(entity_type).map_or(&[], Vec::as_slice)
    }

    fn digest(collections: &BTreeMap<EntityType, Vec<EntityRecord>>) -> Result<String, StorageError> {
        let bytes = serde_json::to_vec(collections)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    /// Returns true if the stored checksum matches the contents.
    pub fn verify(&self) -> Result<bool, StorageError> {
        Ok(Self::digest(&self.collections)? == self.checksum)
    }
}

/// Summary row for listing backups without loading them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    /// Identifier.
    pub id: BackupId,
    /// When the copy was taken.
    pub created_at: DateTime<Utc>,
    /// Total records captured.
    pub record_count: usize,
}

/// Stores and restores [`BackupSnapshot`]s.
pub struct BackupVault {
    system: Arc<dyn StorageBackend>,
}

impl BackupVault {
    /// Creates a vault over a system backend.
    #[must_use]
    pub fn new(system: Arc<dyn StorageBackend>) -> Self {
        Self { system }
    }

    fn collection() -> EntityType {
        EntityType::from(BACKUP_COLLECTION)
    }

    /// Copies every collection of `legacy`, plus any of `also_include`, and
    /// stores the snapshot.
    ///
    /// # Errors
    /// Any read or write failure aborts the capture; nothing is stored.
    pub fn capture(
        &self,
        legacy: &dyn StorageBackend,
        also_include: &[EntityType],
    ) -> Result<BackupSnapshot, StorageError> {
        let mut types = legacy.entity_types()?;
        types.extend(also_include.iter().cloned());
        types.sort();
        types.dedup();

        let mut collections = BTreeMap::new();
        for entity_type in types.into_iter().filter(|t| !t.is_reserved()) {
            let records = legacy.get_all(&entity_type)?;
            debug!(entity_type = %entity_type, records = records.len(), "captured collection");
            if !records.is_empty() {
                collections.insert(entity_type, records);
            }
        }

        let checksum = BackupSnapshot::digest(&collections)?;
        let mut created_at = Utc::now();
        // Timestamps key the collection; nudge forward on a same-instant collision.
        for _ in 0..16 {
            let snapshot = BackupSnapshot {
                id: BackupId::from_timestamp(created_at),
                created_at,
                collections: collections.clone(),
                checksum: checksum.clone(),
            };
            match self.save(&snapshot) {
                Ok(()) => {
                    info!(backup = %snapshot.id, records = snapshot.record_count(), "backup created");
                    return Ok(snapshot);
                }
                Err(StorageError::DuplicateKey { .. }) => {
                    created_at += Duration::nanoseconds(1);
                }
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::Backend("could not allocate a unique backup id".to_string()))
    }

    fn save(&self, snapshot: &BackupSnapshot) -> Result<(), StorageError> {
        let mut fields = Fields::new();
        fields.insert("created_at".to_string(), serde_json::to_value(snapshot.created_at)?);
        fields.insert("checksum".to_string(), snapshot.checksum.clone().into());
        fields.insert("record_count".to_string(), snapshot.record_count().into());
        fields.insert("collections".to_string(), serde_json::to_value(&snapshot.collections)?);
        let record = EntityRecord {
            id: Some(RecordId::new(snapshot.id.as_str())),
            fields,
        };
        self.system.create(&Self::collection(), record).map(|_| ())
    }

    fn decode(record: EntityRecord) -> Result<BackupSnapshot, StorageError> {
        #[derive(Deserialize)]
        struct Stored {
            created_at: DateTime<Utc>,
            checksum: String,
            collections: BTreeMap<EntityType, Vec<EntityRecord>>,
        }

        let id = record
            .id
            .clone()
            .ok_or_else(|| StorageError::Corrupt("backup record without id".to_string()))?;
        let stored: Stored = serde_json::from_value(serde_json::Value::Object(record.fields))
            .map_err(|e| StorageError::Corrupt(format!("backup {id}: {e}")))?;
        Ok(BackupSnapshot {
            id: BackupId::new(id.as_str()),
            created_at: stored.created_at,
            collections: stored.collections,
            checksum: stored.checksum,
        })
    }

    /// Loads a snapshot and verifies its checksum.
    ///
    /// # Errors
    /// - `NotFound` if no such backup exists
    /// - `Corrupt` if the payload fails to decode or the checksum mismatches
    pub fn load(&self, id: &BackupId) -> Result<BackupSnapshot, StorageError> {
        let record = self
            .system
            .get_by_id(&Self::collection(), &RecordId::new(id.as_str()))?;
        let snapshot = Self::decode(record)?;
        if !snapshot.verify()? {
            return Err(StorageError::Corrupt(format!("backup {id} failed checksum verification")));
        }
        Ok(snapshot)
    }

    /// Lists stored backups, oldest first.
    pub fn list(&self) -> Result<Vec<BackupSummary>, StorageError> {
        let mut out: Vec<BackupSummary> = self
            .system
            .get_all(&Self::collection())?
            .into_iter()
            .map(|record| {
                let snapshot = Self::decode(record)?;
                Ok(BackupSummary {
                    record_count: snapshot.record_count(),
                    id: snapshot.id,
                    created_at: snapshot.created_at,
                })
            })
            .collect::<Result<_, StorageError>>()?;
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// Loads the most recent backup, if any.
    pub fn latest(&self) -> Result<Option<BackupSnapshot>, StorageError> {
        match self.list()?.pop() {
            Some(summary) => self.load(&summary.id).map(Some),
            None => Ok(None),
        }
    }

    /// Deletes a backup.
    ///
    /// # Errors
    /// `NotFound` if no such backup exists.
    pub fn discard(&self, id: &BackupId) -> Result<(), StorageError> {
        self.system
            .delete(&Self::collection(), &RecordId::new(id.as_str()))?;
        info!(backup = %id, "backup discarded");
        Ok(())
    }

    /// Replaces the contents of `legacy` with the snapshot.
    ///
    /// Reserved collections (`_backups`, `_system`, and the like) are left
    /// untouched, so a legacy store that doubles as the system store keeps
    /// its backups and metadata.
    ///
    /// Returns the number of records written per entity type.
    ///
    /// # Errors
    /// The first write failure is returned. The legacy store may then be
    /// partially restored; restoring again from the same snapshot is safe.
    pub fn restore(
        &self,
        snapshot: &BackupSnapshot,
        legacy: &dyn StorageBackend,
    ) -> Result<BTreeMap<EntityType, usize>, StorageError> {
        if !snapshot.verify()? {
            return Err(StorageError::Corrupt(format!(
                "backup {} failed checksum verification",
                snapshot.id
            )));
        }

        let mut stale: BTreeSet<EntityType> = legacy
            .entity_types()?
            .into_iter()
            .filter(|t| !t.is_reserved())
            .collect();
        stale.extend(snapshot.collections.keys().cloned());
        for entity_type in &stale {
            legacy.clear(entity_type)?;
        }
        let mut restored = BTreeMap::new();
        for (entity_type, records) in &snapshot.collections {
            let outcome = legacy.bulk_create(entity_type, records.clone());
            let written = outcome.len();
            if let Some(err) = outcome.into_iter().find_map(Result::err) {
                return Err(err);
            }
            restored.insert(entity_type.clone(), written);
        }
        info!(backup = %snapshot.id, "legacy store restored from backup");
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryBackend, KeyValueBackend, MemoryKeyValueStore};
    use serde_json::json;

    fn legacy_with_rows() -> KeyValueBackend<MemoryKeyValueStore> {
        let kv = KeyValueBackend::new(MemoryKeyValueStore::new());
        kv.create(&EntityType::Clients, EntityRecord::default().field("name", "Acme"))
            .unwrap();
        kv.create(&EntityType::Clients, EntityRecord::with_id("c2").field("name", "Beta"))
            .unwrap();
        kv.create(&EntityType::Cases, EntityRecord::with_id("k1").field("clientId", "c2"))
            .unwrap();
        kv
    }

    #[test]
    fn test_capture_and_load_roundtrip() {
        let vault = BackupVault::new(Arc::new(InMemoryBackend::new()));
        let legacy = legacy_with_rows();

        let snapshot = vault.capture(&legacy, &[]).unwrap();
        assert_eq!(snapshot.record_count(), 3);
        assert!(snapshot.verify().unwrap());

        let loaded = vault.load(&snapshot.id).unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_list_and_latest_order() {
        let vault = BackupVault::new(Arc::new(InMemoryBackend::new()));
        let legacy = legacy_with_rows();
        let first = vault.capture(&legacy, &[]).unwrap();
        legacy
            .create(&EntityType::Tasks, EntityRecord::with_id("t1"))
            .unwrap();
        let second = vault.capture(&legacy, &[]).unwrap();

        let list = vault.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, first.id);
        assert_eq!(vault.latest().unwrap().unwrap().id, second.id);

        vault.discard(&second.id).unwrap();
        assert_eq!(vault.latest().unwrap().unwrap().id, first.id);
        assert!(vault.discard(&second.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_restore_replaces_legacy_contents() {
        let vault = BackupVault::new(Arc::new(InMemoryBackend::new()));
        let legacy = legacy_with_rows();
        let snapshot = vault.capture(&legacy, &[]).unwrap();

        legacy.delete(&EntityType::Clients, &"c2".into()).unwrap();
        legacy
            .create(&EntityType::Tasks, EntityRecord::with_id("stray"))
            .unwrap();

        let restored = vault.restore(&snapshot, &legacy).unwrap();
        assert_eq!(restored.get(&EntityType::Clients), Some(&2));
        assert_eq!(legacy.get_all(&EntityType::Clients).unwrap(), snapshot.records(&EntityType::Clients));
        assert!(legacy.get_all(&EntityType::Tasks).unwrap().is_empty());
    }

    #[test]
    fn test_restore_keeps_reserved_collections() {
        let shared = Arc::new(legacy_with_rows());
        let vault = BackupVault::new(shared.clone());
        let snapshot = vault.capture(shared.as_ref(), &[]).unwrap();
        vault.capture(shared.as_ref(), &[]).unwrap();
        shared
            .create(&EntityType::Tasks, EntityRecord::with_id("stray"))
            .unwrap();

        vault.restore(&snapshot, shared.as_ref()).unwrap();
        assert_eq!(vault.list().unwrap().len(), 2);
        assert_eq!(shared.count(&EntityType::Clients).unwrap(), 2);
        assert!(shared.get_all(&EntityType::Tasks).unwrap().is_empty());
    }

    #[test]
    fn test_tampered_backup_is_rejected() {
        let system = Arc::new(InMemoryBackend::new());
        let vault = BackupVault::new(system.clone());
        let snapshot = vault.capture(&legacy_with_rows(), &[]).unwrap();

        let tamper = json!({"checksum": "0000"});
        system
            .update(
                &EntityType::from(BACKUP_COLLECTION),
                &RecordId::new(snapshot.id.as_str()),
                tamper.as_object().unwrap().clone(),
            )
            .unwrap();
        assert!(matches!(vault.load(&snapshot.id), Err(StorageError::Corrupt(_))));
    }
}
