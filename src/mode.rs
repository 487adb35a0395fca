//! Migration mode and the persisted state machine that gates routing.
//!
//! The mode lives in a singleton metadata record inside a system backend so it
//! survives restarts. Writers hold the state lock across persist-and-publish,
//! so a read issued after [`MigrationStateMachine::advance`] returns always
//! observes the new mode.

use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backup::BackupId;
use crate::error::{EngineResult, PreconditionError};
use crate::record::{EntityRecord, EntityType, RecordId};
use crate::storage::{StorageBackend, StorageError};

/// Collection holding engine bookkeeping records.
pub const SYSTEM_COLLECTION: &str = "_system";

/// Id of the migration metadata record.
pub const METADATA_ID: &str = "migration_metadata";

/// Which backend is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    /// Legacy store only.
    #[default]
    Legacy,
    /// Dual-write window: target first, legacy mirrored.
    Transitioning,
    /// Target store only.
    Modern,
}

impl MigrationMode {
    /// Returns true if `self -> to` is an allowed edge.
    ///
    /// Forward edges are `Legacy -> Transitioning` and `Transitioning -> Modern`.
    /// Rollback to `Legacy` is allowed from every mode.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Legacy, Self::Transitioning) | (Self::Transitioning, Self::Modern) | (_, Self::Legacy)
        )
    }

    /// Returns true when reads and writes touch the legacy store.
    #[must_use]
    pub const fn uses_legacy(self) -> bool {
        !matches!(self, Self::Modern)
    }

    /// Returns true when reads and writes touch the target store.
    #[must_use]
    pub const fn uses_target(self) -> bool {
        !matches!(self, Self::Legacy)
    }
}

impl fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy"),
            Self::Transitioning => write!(f, "transitioning"),
            Self::Modern => write!(f, "modern"),
        }
    }
}

/// The persisted singleton describing migration progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MigrationMetadata {
    /// Current mode.
    pub mode: MigrationMode,
    /// When the last fully successful migration run finished.
    pub last_migrated_at: Option<DateTime<Utc>>,
    /// Backup armed for the next migration run.
    pub active_backup: Option<BackupId>,
    /// When the last rollback finished.
    pub last_rollback_at: Option<DateTime<Utc>>,
    /// Last write to this record.
    pub updated_at: Option<DateTime<Utc>>,
}

impl MigrationMetadata {
    fn to_record(&self) -> Result<EntityRecord, StorageError> {
        let serde_json::Value::Object(fields) = serde_json::to_value(self)? else {
            return Err(StorageError::Serialization(
                "migration metadata did not serialize to an object".to_string(),
            ));
        };
        Ok(EntityRecord {
            id: Some(RecordId::from(METADATA_ID)),
            fields,
        })
    }

    fn from_record(record: EntityRecord) -> Result<Self, StorageError> {
        serde_json::from_value(serde_json::Value::Object(record.fields))
            .map_err(|e| StorageError::Corrupt(format!("migration metadata: {e}")))
    }
}

/// Tracks and persists the current [`MigrationMode`].
pub struct MigrationStateMachine {
    system: Arc<dyn StorageBackend>,
    state: RwLock<MigrationMetadata>,
}

impl MigrationStateMachine {
    /// Loads persisted metadata, defaulting to `Legacy` on first use.
    ///
    /// # Errors
    /// Returns the backend error if the metadata record cannot be read or decoded.
    pub fn open(system: Arc<dyn StorageBackend>) -> Result<Self, StorageError> {
        let metadata = match system.get_by_id(&Self::collection(), &RecordId::from(METADATA_ID)) {
            Ok(record) => MigrationMetadata::from_record(record)?,
            Err(e) if e.is_not_found() => MigrationMetadata::default(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            system,
            state: RwLock::new(metadata),
        })
    }

    fn collection() -> EntityType {
        EntityType::from(SYSTEM_COLLECTION)
    }

    /// Current mode.
    #[must_use]
    pub fn current_mode(&self) -> MigrationMode {
        self.metadata().mode
    }

    /// Snapshot of the persisted metadata.
    #[must_use]
    pub fn metadata(&self) -> MigrationMetadata {
        match self.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Moves to `to` if the edge is allowed.
    ///
    /// Moving to the current mode is a no-op except for `Legacy`, which is
    /// always accepted as a rollback.
    ///
    /// # Errors
    /// - `InvalidTransition` for any edge not listed on [`MigrationMode::can_transition_to`]
    /// - Storage errors if persisting fails; the mode is then unchanged
    pub fn advance(&self, to: MigrationMode) -> EngineResult<MigrationMode> {
        self.modify(|meta| {
            let from = meta.mode;
            if from == to {
                return Ok(());
            }
            if !from.can_transition_to(to) {
                return Err(PreconditionError::InvalidTransition { from, to }.into());
            }
            meta.mode = to;
            Ok(())
        })
        .map(|meta| meta.mode)
    }

    /// Applies `f` to a copy of the metadata, persists it, then publishes it.
    ///
    /// If `f` or the write fails nothing changes.
    pub(crate) fn modify<F>(&self, f: F) -> EngineResult<MigrationMetadata>
    where
        F: FnOnce(&mut MigrationMetadata) -> EngineResult<()>,
    {
        let mut guard = self
            .state
            .write()
            .map_err(|_| StorageError::Backend("poisoned lock: mode.modify".to_string()))?;
        let before = guard.mode;
        let mut next = guard.clone();
        f(&mut next)?;
        if next == *guard {
            return Ok(next);
        }
        next.updated_at = Some(Utc::now());
        self.persist(&next)?;
        *guard = next.clone();
        if before != next.mode {
            info!(from = %before, to = %next.mode, "migration mode changed");
        }
        Ok(next)
    }

    fn persist(&self, metadata: &MigrationMetadata) -> Result<(), StorageError> {
        let record = metadata.to_record()?;
        let collection = Self::collection();
        let id = RecordId::from(METADATA_ID);
        match self.system.update(&collection, &id, record.fields.clone()) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => self.system.create(&collection, record).map(|_| ()),
            Err(e) => Err(e),
        }
    }
}
