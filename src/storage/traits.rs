//! Abstract storage traits for dualstore.
//!
//! A [`StorageBackend`] is pure storage mechanics: it has no notion of legacy
//! vs modern and never looks at the migration mode. The same trait fronts the
//! flat key-value store being phased out and the structured store replacing it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{EntityRecord, EntityType, Fields, RecordId};

/// Whether retrying an operation unchanged may succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Busy, quota, lock contention: retry with backoff.
    Transient,
    /// Malformed data, schema violation, duplicate key: retrying won't help.
    Permanent,
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Record not found.
    #[error("Record not found: {entity_type}/{id}")]
    NotFound {
        /// Collection searched.
        entity_type: EntityType,
        /// Missing id.
        id: RecordId,
    },

    /// Key already exists.
    #[error("Duplicate key: {entity_type}/{id}")]
    DuplicateKey {
        /// Collection written.
        entity_type: EntityType,
        /// Conflicting id.
        id: RecordId,
    },

    /// Record has no id but the backend requires one.
    #[error("Record for '{0}' has no id")]
    MissingId(EntityType),

    /// Backend busy or locked.
    #[error("Backend busy: {0}")]
    Busy(String),

    /// Storage quota exhausted.
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Backend cannot be reached at all.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Stored payload failed to decode or verify.
    #[error("Corrupt payload: {0}")]
    Corrupt(String),

    /// Record violates the backend's schema.
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Classifies this error for retry decisions.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Busy(_) | Self::QuotaExceeded(_) | Self::Unavailable(_) => ErrorClass::Transient,
            Self::NotFound { .. }
            | Self::DuplicateKey { .. }
            | Self::MissingId(_)
            | Self::Corrupt(_)
            | Self::SchemaViolation(_)
            | Self::Serialization(_)
            | Self::Backend(_) => ErrorClass::Permanent,
        }
    }

    /// Returns true if a retry may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Returns true for a not-found lookup.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true when the whole backend is gone rather than one record failing.
    #[must_use]
    pub const fn is_catastrophic(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub(crate) fn not_found(entity_type: &EntityType, id: &RecordId) -> Self {
        Self::NotFound {
            entity_type: entity_type.clone(),
            id: id.clone(),
        }
    }

    pub(crate) fn duplicate(entity_type: &EntityType, id: &RecordId) -> Self {
        Self::DuplicateKey {
            entity_type: entity_type.clone(),
            id: id.clone(),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Per-record outcome of a bulk write, in input order.
pub type BulkOutcome = Vec<Result<EntityRecord, StorageError>>;

/// Uniform interface over a concrete storage backend.
///
/// # Safety Considerations
/// - Single mutations should be atomic where the backend allows it
/// - Implementations must be safe to share across threads
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs and reports.
    fn name(&self) -> &str;

    /// List every record of an entity type.
    fn get_all(&self, entity_type: &EntityType) -> Result<Vec<EntityRecord>, StorageError>;

    /// Get a record by id. Returns `NotFound` if absent.
    fn get_by_id(&self, entity_type: &EntityType, id: &RecordId) -> Result<EntityRecord, StorageError>;

    /// Insert a record. Returns `DuplicateKey` if the id already exists.
    fn create(&self, entity_type: &EntityType, record: EntityRecord) -> Result<EntityRecord, StorageError>;

    /// Overlay `partial` onto an existing record. Returns `NotFound` if absent.
    fn update(
        &self,
        entity_type: &EntityType,
        id: &RecordId,
        partial: Fields,
    ) -> Result<EntityRecord, StorageError>;

    /// Delete a record. Returns `NotFound` if absent.
    fn delete(&self, entity_type: &EntityType, id: &RecordId) -> Result<(), StorageError>;

    /// Insert many records; each one succeeds or fails on its own.
    ///
    /// The default applies `create` per record. The returned list always has
    /// one entry per input record.
    fn bulk_create(&self, entity_type: &EntityType, records: Vec<EntityRecord>) -> BulkOutcome {
        records
            .into_iter()
            .map(|record| self.create(entity_type, record))
            .collect()
    }

    /// Remove every record of an entity type.
    fn clear(&self, entity_type: &EntityType) -> Result<(), StorageError>;

    /// Remove every record of every entity type.
    fn clear_all(&self) -> Result<(), StorageError>;

    /// List entity types that currently hold at least one record.
    fn entity_types(&self) -> Result<Vec<EntityType>, StorageError>;

    /// Count records of an entity type.
    fn count(&self, entity_type: &EntityType) -> Result<usize, StorageError> {
        Ok(self.get_all(entity_type)?.len())
    }
}
