//! Flat key-value backend (the legacy store layout).
//!
//! Each entity type lives under a single key, `{prefix}{entity_type}`, whose
//! value is a JSON array of record objects. Records may lack an id, and ids
//! written by older clients may be numbers rather than strings. Every write
//! rewrites the whole array, so quota pressure surfaces as a transient
//! [`StorageError::QuotaExceeded`].

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde_json::Value;

use crate::record::{EntityRecord, EntityType, Fields, RecordId, ID_FIELD};
use crate::storage::memory::lock_err;
use crate::storage::traits::{BulkOutcome, StorageBackend, StorageError};

/// Default key prefix for entity collections.
pub const DEFAULT_PREFIX: &str = "app_";

/// Minimal string key-value store, the shape of a browser-style local storage.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: String) -> Result<(), StorageError>;

    /// Remove a key. Missing keys are not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// List all keys.
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// In-memory [`KeyValueStore`] with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryKeyValueStore {
    /// Create an unbounded store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that rejects writes once keys plus values exceed `bytes`.
    #[must_use]
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            quota_bytes: Some(bytes),
        }
    }

    /// Total bytes held (keys plus values).
    pub fn used_bytes(&self) -> Result<usize, StorageError> {
        let entries = self.entries.read().map_err(|_| lock_err("kv.used_bytes"))?;
        Ok(entries.iter().map(|(k, v)| k.len() + v.len()).sum())
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.read().map_err(|_| lock_err("kv.get"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| lock_err("kv.set"))?;
        if let Some(quota) = self.quota_bytes {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = used + key.len() + value.len();
            if needed > quota {
                return Err(StorageError::QuotaExceeded(format!(
                    "write of '{key}' needs {needed} bytes, quota is {quota}"
                )));
            }
        }
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| lock_err("kv.remove"))?;
        entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let entries = self.entries.read().map_err(|_| lock_err("kv.keys"))?;
        Ok(entries.keys().cloned().collect())
    }
}

/// Returns the id a legacy row answers to, accepting numeric ids.
fn legacy_id(record: &EntityRecord) -> Option<String> {
    if let Some(id) = &record.id {
        return Some(id.as_str().to_string());
    }
    match record.fields.get(ID_FIELD) {
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// [`StorageBackend`] over a flat [`KeyValueStore`].
#[derive(Debug)]
pub struct KeyValueBackend<S> {
    store: S,
    prefix: String,
}

impl<S: KeyValueStore> KeyValueBackend<S> {
    /// Wrap a key-value store using [`DEFAULT_PREFIX`].
    pub fn new(store: S) -> Self {
        Self::with_prefix(store, DEFAULT_PREFIX)
    }

    /// Wrap a key-value store using a custom key prefix.
    pub fn with_prefix(store: S, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Access the underlying key-value store.
    pub fn store(&self) -> &S {
        &self.store
    }

    fn key(&self, entity_type: &EntityType) -> String {
        format!("{}{}", self.prefix, entity_type)
    }

    fn read_rows(&self, entity_type: &EntityType) -> Result<Vec<EntityRecord>, StorageError> {
        let key = self.key(entity_type);
        let Some(raw) = self.store.get(&key)? else {
            return Ok(Vec::new());
        };
        let parsed: Value = serde_json::from_str(&raw)
            .map_err(|e| StorageError::Corrupt(format!("key '{key}': {e}")))?;
        let Value::Array(items) = parsed else {
            return Err(StorageError::Corrupt(format!("key '{key}' does not hold an array")));
        };
        items
            .into_iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(fields) => Ok(EntityRecord::from_fields(fields)),
                other => Err(StorageError::Corrupt(format!(
                    "key '{key}' element {i} is not an object: {other}"
                ))),
            })
            .collect()
    }

    fn write_rows(&self, entity_type: &EntityType, rows: &[EntityRecord]) -> Result<(), StorageError> {
        let key = self.key(entity_type);
        if rows.is_empty() {
            return self.store.remove(&key);
        }
        let array: Vec<Value> = rows.iter().map(|r| Value::Object(r.to_object())).collect();
        let raw = serde_json::to_string(&array)?;
        self.store.set(&key, raw)
    }

    fn position(rows: &[EntityRecord], id: &RecordId) -> Option<usize> {
        rows.iter()
            .position(|r| legacy_id(r).as_deref() == Some(id.as_str()))
    }

    fn append(
        rows: &mut Vec<EntityRecord>,
        entity_type: &EntityType,
        record: EntityRecord,
    ) -> Result<EntityRecord, StorageError> {
        if let Some(id) = legacy_id(&record) {
            let id = RecordId::new(id);
            if Self::position(rows, &id).is_some() {
                return Err(StorageError::duplicate(entity_type, &id));
            }
        }
        rows.push(record.clone());
        Ok(record)
    }
}

impl<S: KeyValueStore> StorageBackend for KeyValueBackend<S> {
    fn name(&self) -> &str {
        "key-value"
    }

    fn get_all(&self, entity_type: &EntityType) -> Result<Vec<EntityRecord>, StorageError> {
        self.read_rows(entity_type)
    }

    fn get_by_id(&self, entity_type: &EntityType, id: &RecordId) -> Result<EntityRecord, StorageError> {
        let rows = self.read_rows(entity_type)?;
        Self::position(&rows, id)
            .map(|i| rows[i].clone())
            .ok_or_else(|| StorageError::not_found(entity_type, id))
    }

    fn create(&self, entity_type: &EntityType, record: EntityRecord) -> Result<EntityRecord, StorageError> {
        let mut rows = self.read_rows(entity_type)?;
        let created = Self::append(&mut rows, entity_type, record)?;
        self.write_rows(entity_type, &rows)?;
        Ok(created)
    }

    fn update(
        &self,
        entity_type: &EntityType,
        id: &RecordId,
        partial: Fields,
    ) -> Result<EntityRecord, StorageError> {
        let mut rows = self.read_rows(entity_type)?;
        let idx = Self::position(&rows, id).ok_or_else(|| StorageError::not_found(entity_type, id))?;
        rows[idx].merge_from(&partial);
        let updated = rows[idx].clone();
        self.write_rows(entity_type, &rows)?;
        Ok(updated)
    }

    fn delete(&self, entity_type: &EntityType, id: &RecordId) -> Result<(), StorageError> {
        let mut rows = self.read_rows(entity_type)?;
        let idx = Self::position(&rows, id).ok_or_else(|| StorageError::not_found(entity_type, id))?;
        rows.remove(idx);
        self.write_rows(entity_type, &rows)
    }

    fn bulk_create(&self, entity_type: &EntityType, records: Vec<EntityRecord>) -> BulkOutcome {
        let mut rows = match self.read_rows(entity_type) {
            Ok(rows) => rows,
            Err(e) => return records.iter().map(|_| Err(e.clone())).collect(),
        };
        let outcome: BulkOutcome = records
            .into_iter()
            .map(|record| Self::append(&mut rows, entity_type, record))
            .collect();

        // The array is written once; if that write fails, every staged row fails with it.
        match self.write_rows(entity_type, &rows) {
            Ok(()) => outcome,
            Err(e) => outcome
                .into_iter()
                .map(|r| r.and_then(|_| Err(e.clone())))
                .collect(),
        }
    }

    fn clear(&self, entity_type: &EntityType) -> Result<(), StorageError> {
        self.store.remove(&self.key(entity_type))
    }

    fn clear_all(&self) -> Result<(), StorageError> {
        for key in self.store.keys()? {
            if key.starts_with(&self.prefix) {
                self.store.remove(&key)?;
            }
        }
        Ok(())
    }

    fn entity_types(&self) -> Result<Vec<EntityType>, StorageError> {
        let mut out = Vec::new();
        for key in self.store.keys()? {
            let Some(name) = key.strip_prefix(&self.prefix) else {
                continue;
            };
            let entity_type = EntityType::from(name);
            if !self.read_rows(&entity_type)?.is_empty() {
                out.push(entity_type);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend() -> KeyValueBackend<MemoryKeyValueStore> {
        KeyValueBackend::new(MemoryKeyValueStore::new())
    }

    fn seed(kv: &KeyValueBackend<MemoryKeyValueStore>, entity_type: &str, value: Value) {
        kv.store()
            .set(&format!("{DEFAULT_PREFIX}{entity_type}"), value.to_string())
            .unwrap();
    }

    #[test]
    fn test_reads_legacy_array_with_missing_and_numeric_ids() {
        let kv = backend();
        seed(
            &kv,
            "clients",
            json!([{"name": "Acme"}, {"id": "c2", "name": "Beta"}, {"id": 1700000000000_i64, "name": "Gamma"}]),
        );

        let rows = kv.get_all(&EntityType::Clients).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].id.is_none());
        assert_eq!(rows[1].id, Some(RecordId::from("c2")));

        let gamma = kv.get_by_id(&EntityType::Clients, &"1700000000000".into()).unwrap();
        assert_eq!(gamma.get("name"), Some(&json!("Gamma")));
    }

    #[test]
    fn test_corrupt_payload_is_permanent() {
        let kv = backend();
        kv.store().set("app_cases", "{not json".to_string()).unwrap();
        let err = kv.get_all(&EntityType::Cases).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_crud_roundtrip() {
        let kv = backend();
        kv.create(&EntityType::Tasks, EntityRecord::with_id("t1").field("title", "File motion"))
            .unwrap();
        let dup = kv
            .create(&EntityType::Tasks, EntityRecord::with_id("t1"))
            .unwrap_err();
        assert!(matches!(dup, StorageError::DuplicateKey { .. }));

        let patch = json!({"done": true});
        let updated = kv
            .update(&EntityType::Tasks, &"t1".into(), patch.as_object().unwrap().clone())
            .unwrap();
        assert_eq!(updated.get("done"), Some(&json!(true)));

        kv.delete(&EntityType::Tasks, &"t1".into()).unwrap();
        assert!(kv.get_all(&EntityType::Tasks).unwrap().is_empty());
        assert!(kv.store().get("app_tasks").unwrap().is_none());
    }

    #[test]
    fn test_records_without_id_can_be_appended() {
        let kv = backend();
        kv.create(&EntityType::Clients, EntityRecord::default().field("name", "A"))
            .unwrap();
        kv.create(&EntityType::Clients, EntityRecord::default().field("name", "A"))
            .unwrap();
        assert_eq!(kv.count(&EntityType::Clients).unwrap(), 2);
    }

    #[test]
    fn test_quota_exceeded_is_transient() {
        let kv = KeyValueBackend::new(MemoryKeyValueStore::with_quota(64));
        let big = "x".repeat(100);
        let err = kv
            .create(&EntityType::Clients, EntityRecord::with_id("c1").field("notes", big))
            .unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_bulk_create_reports_every_row() {
        let kv = backend();
        let outcome = kv.bulk_create(
            &EntityType::Clients,
            vec![
                EntityRecord::with_id("a"),
                EntityRecord::with_id("a"),
                EntityRecord::with_id("b"),
            ],
        );
        assert_eq!(outcome.len(), 3);
        assert!(outcome[0].is_ok());
        assert!(outcome[1].is_err());
        assert!(outcome[2].is_ok());
        assert_eq!(kv.count(&EntityType::Clients).unwrap(), 2);
    }

    #[test]
    fn test_entity_types_and_clear_all_respect_prefix() {
        let kv = backend();
        kv.store().set("unrelated", "keep".to_string()).unwrap();
        kv.create(&EntityType::Clients, EntityRecord::with_id("a")).unwrap();
        kv.create(&EntityType::from("hearings"), EntityRecord::with_id("h")).unwrap();

        let mut types = kv.entity_types().unwrap();
        types.sort();
        assert_eq!(
            types,
            vec![EntityType::Clients, EntityType::Custom("hearings".to_string())]
        );

        kv.clear_all().unwrap();
        assert!(kv.entity_types().unwrap().is_empty());
        assert_eq!(kv.store().get("unrelated").unwrap().as_deref(), Some("keep"));
    }
}
