//! In-memory structured backend.
//!
//! This module provides a thread-safe, id-keyed implementation of
//! [`StorageBackend`]. It plays the structured target store in embedded use
//! and tests, and is the reference implementation for backend semantics.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::record::{EntityRecord, EntityType, Fields, RecordId};
use crate::storage::traits::{BulkOutcome, StorageBackend, StorageError};

pub(crate) fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

type Collection = BTreeMap<RecordId, Fields>;

#[derive(Debug, Default)]
struct State {
    collections: BTreeMap<EntityType, Collection>,
}

fn materialize(id: &RecordId, fields: &Fields) -> EntityRecord {
    EntityRecord {
        id: Some(id.clone()),
        fields: fields.clone(),
    }
}

fn insert_into(
    state: &mut State,
    entity_type: &EntityType,
    record: EntityRecord,
) -> Result<EntityRecord, StorageError> {
    let id = record
        .id
        .clone()
        .ok_or_else(|| StorageError::MissingId(entity_type.clone()))?;
    let collection = state.collections.entry(entity_type.clone()).or_default();
    if collection.contains_key(&id) {
        return Err(StorageError::duplicate(entity_type, &id));
    }
    collection.insert(id, record.fields.clone());
    Ok(record)
}

/// Thread-safe in-memory structured store.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    name: String,
    state: RwLock<State>,
}

impl InMemoryBackend {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// Create a new empty store with a display name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(State::default()),
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_all(&self, entity_type: &EntityType) -> Result<Vec<EntityRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("memory.get_all"))?;
        Ok(state
            .collections
            .get(entity_type)
            .map(|c| c.iter().map(|(id, f)| materialize(id, f)).collect())
            .unwrap_or_default())
    }

    fn get_by_id(&self, entity_type: &EntityType, id: &RecordId) -> Result<EntityRecord, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("memory.get_by_id"))?;
        state
            .collections
            .get(entity_type)
            .and_then(|c| c.get(id))
            .map(|f| materialize(id, f))
            .ok_or_else(|| StorageError::not_found(entity_type, id))
    }

    fn create(&self, entity_type: &EntityType, record: EntityRecord) -> Result<EntityRecord, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("memory.create"))?;
        insert_into(&mut state, entity_type, record)
    }

    fn update(
        &self,
        entity_type: &EntityType,
        id: &RecordId,
        partial: Fields,
    ) -> Result<EntityRecord, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("memory.update"))?;
        let fields = state
            .collections
            .get_mut(entity_type)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| StorageError::not_found(entity_type, id))?;

        let mut record = materialize(id, fields);
        record.merge_from(&partial);
        fields.clone_from(&record.fields);
        Ok(record)
    }

    fn delete(&self, entity_type: &EntityType, id: &RecordId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("memory.delete"))?;
        let removed = state
            .collections
            .get_mut(entity_type)
            .and_then(|c| c.remove(id));
        if removed.is_none() {
            return Err(StorageError::not_found(entity_type, id));
        }
        if state.collections.get(entity_type).is_some_and(BTreeMap::is_empty) {
            state.collections.remove(entity_type);
        }
        Ok(())
    }

    fn bulk_create(&self, entity_type: &EntityType, records: Vec<EntityRecord>) -> BulkOutcome {
        // One lock acquisition for the whole batch; records still fail independently.
        let Ok(mut state) = self.state.write() else {
            return records
                .iter()
                .map(|_| Err(lock_err("memory.bulk_create")))
                .collect();
        };
        records
            .into_iter()
            .map(|record| insert_into(&mut state, entity_type, record))
            .collect()
    }

    fn clear(&self, entity_type: &EntityType) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("memory.clear"))?;
        state.collections.remove(entity_type);
        Ok(())
    }

    fn clear_all(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("memory.clear_all"))?;
        state.collections.clear();
        Ok(())
    }

    fn entity_types(&self) -> Result<Vec<EntityType>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("memory.entity_types"))?;
        Ok(state
            .collections
            .iter()
            .filter(|(_, c)| !c.is_empty())
            .map(|(t, _)| t.clone())
            .collect())
    }

    fn count(&self, entity_type: &EntityType) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("memory.count"))?;
        Ok(state.collections.get(entity_type).map_or(0, BTreeMap::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client(id: &str, name: &str) -> EntityRecord {
        EntityRecord::with_id(id).field("name", name)
    }

    #[test]
    fn test_create_and_get() {
        let store = InMemoryBackend::new();
        store.create(&EntityType::Clients, client("c1", "Acme")).unwrap();

        let got = store.get_by_id(&EntityType::Clients, &"c1".into()).unwrap();
        assert_eq!(got.get("name"), Some(&json!("Acme")));
        assert_eq!(store.count(&EntityType::Clients).unwrap(), 1);
    }

    #[test]
    fn test_create_rejects_duplicate() {
        let store = InMemoryBackend::new();
        store.create(&EntityType::Clients, client("c1", "Acme")).unwrap();
        let err = store.create(&EntityType::Clients, client("c1", "Other")).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey { .. }));

        // Same id in a different collection is fine.
        store.create(&EntityType::Cases, client("c1", "Other")).unwrap();
    }

    #[test]
    fn test_create_requires_id() {
        let store = InMemoryBackend::new();
        let err = store
            .create(&EntityType::Clients, EntityRecord::default().field("name", "x"))
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingId(_)));
    }

    #[test]
    fn test_update_merges_fields() {
        let store = InMemoryBackend::new();
        store.create(&EntityType::Clients, client("c1", "Acme")).unwrap();
        let patch = json!({"phone": "555", "name": "Acme Corp"});
        let updated = store
            .update(&EntityType::Clients, &"c1".into(), patch.as_object().unwrap().clone())
            .unwrap();
        assert_eq!(updated.get("name"), Some(&json!("Acme Corp")));
        assert_eq!(updated.get("phone"), Some(&json!("555")));

        let missing = store
            .update(&EntityType::Clients, &"nope".into(), Fields::new())
            .unwrap_err();
        assert!(missing.is_not_found());
    }

    #[test]
    fn test_delete_and_entity_types() {
        let store = InMemoryBackend::new();
        store.create(&EntityType::Clients, client("c1", "Acme")).unwrap();
        store.create(&EntityType::Cases, client("k1", "Case")).unwrap();
        assert_eq!(store.entity_types().unwrap().len(), 2);

        store.delete(&EntityType::Cases, &"k1".into()).unwrap();
        assert_eq!(store.entity_types().unwrap(), vec![EntityType::Clients]);
        assert!(store.delete(&EntityType::Cases, &"k1".into()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_bulk_create_partial_success() {
        let store = InMemoryBackend::new();
        store.create(&EntityType::Clients, client("c2", "Existing")).unwrap();

        let outcome = store.bulk_create(
            &EntityType::Clients,
            vec![
                client("c1", "A"),
                client("c2", "B"),
                EntityRecord::default(),
                client("c3", "C"),
            ],
        );
        assert_eq!(outcome.len(), 4);
        assert!(outcome[0].is_ok());
        assert!(matches!(outcome[1], Err(StorageError::DuplicateKey { .. })));
        assert!(matches!(outcome[2], Err(StorageError::MissingId(_))));
        assert!(outcome[3].is_ok());
        assert_eq!(store.count(&EntityType::Clients).unwrap(), 3);
    }

    #[test]
    fn test_clear_and_clear_all() {
        let store = InMemoryBackend::new();
        store.create(&EntityType::Clients, client("c1", "A")).unwrap();
        store.create(&EntityType::Tasks, client("t1", "T")).unwrap();

        store.clear(&EntityType::Clients).unwrap();
        assert_eq!(store.count(&EntityType::Clients).unwrap(), 0);
        assert_eq!(store.count(&EntityType::Tasks).unwrap(), 1);

        store.clear_all().unwrap();
        assert!(store.entity_types().unwrap().is_empty());
    }
}
