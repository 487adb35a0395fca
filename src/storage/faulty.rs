//! Fault-injecting backend wrapper.
//!
//! Wraps another [`StorageBackend`] and fails selected calls on demand. Used by
//! the test suites to exercise retry, partial-failure, and fallback paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::record::{EntityRecord, EntityType, Fields, RecordId};
use crate::storage::memory::lock_err;
use crate::storage::traits::{StorageBackend, StorageError};

#[derive(Debug, Default)]
struct Faults {
    /// Remaining transient failures per record id, consumed on `create`.
    transient_creates: HashMap<RecordId, u32>,
    /// Record ids whose `create` always fails permanently.
    poisoned_creates: HashSet<RecordId>,
    /// When set, every read fails with this error.
    read_error: Option<StorageError>,
    /// When set, every call fails with `Unavailable`.
    unavailable: bool,
    /// When set, every write fails with this error.
    write_error: Option<StorageError>,
    create_calls: u64,
}

/// A [`StorageBackend`] that injects failures in front of a real backend.
pub struct FaultyBackend {
    inner: Arc<dyn StorageBackend>,
    faults: Mutex<Faults>,
}

impl FaultyBackend {
    /// Wrap a backend with no faults armed.
    #[must_use]
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Access the wrapped backend, bypassing faults.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn StorageBackend> {
        &self.inner
    }

    /// Fail the next `times` creates of `id` with a transient error.
    pub fn fail_create_transiently(&self, id: impl Into<RecordId>, times: u32) {
        if let Ok(mut f) = self.faults.lock() {
            f.transient_creates.insert(id.into(), times);
        }
    }

    /// Fail every create of `id` with a permanent error.
    pub fn poison_create(&self, id: impl Into<RecordId>) {
        if let Ok(mut f) = self.faults.lock() {
            f.poisoned_creates.insert(id.into());
        }
    }

    /// Make every read fail with `error` (or clear with `None`).
    pub fn fail_reads(&self, error: Option<StorageError>) {
        if let Ok(mut f) = self.faults.lock() {
            f.read_error = error;
        }
    }

    /// Make every write fail with `error` (or clear with `None`).
    pub fn fail_writes(&self, error: Option<StorageError>) {
        if let Ok(mut f) = self.faults.lock() {
            f.write_error = error;
        }
    }

    /// Take the whole backend offline.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut f) = self.faults.lock() {
            f.unavailable = unavailable;
        }
    }

    /// Number of `create` calls seen, including failed ones.
    #[must_use]
    pub fn create_calls(&self) -> u64 {
        self.faults.lock().map_or(0, |f| f.create_calls)
    }

    fn check_read(&self) -> Result<(), StorageError> {
        let f = self.faults.lock().map_err(|_| lock_err("faulty.read"))?;
        if f.unavailable {
            return Err(StorageError::Unavailable(format!("{} offline", self.inner.name())));
        }
        match &f.read_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn check_write(&self) -> Result<(), StorageError> {
        let f = self.faults.lock().map_err(|_| lock_err("faulty.write"))?;
        if f.unavailable {
            return Err(StorageError::Unavailable(format!("{} offline", self.inner.name())));
        }
        match &f.write_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn check_create(&self, record: &EntityRecord) -> Result<(), StorageError> {
        self.check_write()?;
        let mut f = self.faults.lock().map_err(|_| lock_err("faulty.create"))?;
        f.create_calls += 1;
        let Some(id) = record.id.as_ref() else {
            return Ok(());
        };
        if f.poisoned_creates.contains(id) {
            return Err(StorageError::SchemaViolation(format!("record {id} rejected")));
        }
        if let Some(remaining) = f.transient_creates.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::Busy(format!("record {id} locked")));
            }
        }
        Ok(())
    }
}

impl StorageBackend for FaultyBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get_all(&self, entity_type: &EntityType) -> Result<Vec<EntityRecord>, StorageError> {
        self.check_read()?;
        self.inner.get_all(entity_type)
    }

    fn get_by_id(&self, entity_type: &EntityType, id: &RecordId) -> Result<EntityRecord, StorageError> {
        self.check_read()?;
        self.inner.get_by_id(entity_type, id)
    }

    fn create(&self, entity_type: &EntityType, record: EntityRecord) -> Result<EntityRecord, StorageError> {
        self.check_create(&record)?;
        self.inner.create(entity_type, record)
    }

    fn update(
        &self,
        entity_type: &EntityType,
        id: &RecordId,
        partial: Fields,
    ) -> Result<EntityRecord, StorageError> {
        self.check_write()?;
        self.inner.update(entity_type, id, partial)
    }

    fn delete(&self, entity_type: &EntityType, id: &RecordId) -> Result<(), StorageError> {
        self.check_write()?;
        self.inner.delete(entity_type, id)
    }

    fn clear(&self, entity_type: &EntityType) -> Result<(), StorageError> {
        self.check_write()?;
        self.inner.clear(entity_type)
    }

    fn clear_all(&self) -> Result<(), StorageError> {
        self.check_write()?;
        self.inner.clear_all()
    }

    fn entity_types(&self) -> Result<Vec<EntityType>, StorageError> {
        self.check_read()?;
        self.inner.entity_types()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryBackend;

    #[test]
    fn test_transient_create_clears_after_budget() {
        let faulty = FaultyBackend::new(Arc::new(InMemoryBackend::new()));
        faulty.fail_create_transiently("c1", 2);

        for _ in 0..2 {
            let err = faulty
                .create(&EntityType::Clients, EntityRecord::with_id("c1"))
                .unwrap_err();
            assert!(err.is_transient());
        }
        faulty.create(&EntityType::Clients, EntityRecord::with_id("c1")).unwrap();
        assert_eq!(faulty.create_calls(), 3);
    }

    #[test]
    fn test_unavailable_blocks_everything() {
        let faulty = FaultyBackend::new(Arc::new(InMemoryBackend::new()));
        faulty.set_unavailable(true);
        assert!(faulty.get_all(&EntityType::Clients).unwrap_err().is_catastrophic());
        assert!(faulty.clear_all().unwrap_err().is_catastrophic());
        faulty.set_unavailable(false);
        assert!(faulty.get_all(&EntityType::Clients).unwrap().is_empty());
    }
}
