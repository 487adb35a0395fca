//! Append-only audit trail of entity changes.
//!
//! Timeline writes are observability, not a consistency boundary: callers go
//! through [`record_best_effort`], which logs a failed append and carries on.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::record::{EntityRecord, EntityType, RecordId};
use crate::storage::{StorageBackend, StorageError};

/// Collection holding timeline entries.
pub const TIMELINE_COLLECTION: &str = "_timeline";

/// Kind of change recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineAction {
    /// Record created.
    Create,
    /// Record updated.
    Update,
    /// Record deleted.
    Delete,
    /// Workflow step (status change, assignment) recorded by the application.
    Workflow,
}

impl fmt::Display for TimelineAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Workflow => write!(f, "workflow"),
        }
    }
}

/// One audit record. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    /// Entry id.
    pub id: RecordId,
    /// Entity type changed.
    pub entity_type: EntityType,
    /// Id of the changed record.
    pub ref_id: RecordId,
    /// What happened.
    pub action: TimelineAction,
    /// Change payload (the written fields, or null for deletes).
    pub payload: serde_json::Value,
    /// Who made the change.
    pub actor: String,
    /// When.
    pub timestamp: DateTime<Utc>,
}

impl TimelineEntry {
    /// Creates an entry stamped now with a fresh id.
    #[must_use]
    pub fn new(
        entity_type: EntityType,
        ref_id: RecordId,
        action: TimelineAction,
        payload: serde_json::Value,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            id: RecordId::random(),
            entity_type,
            ref_id,
            action,
            payload,
            actor: actor.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Appends and reads timeline entries in a backend.
#[derive(Clone)]
pub struct Timeline {
    backend: Arc<dyn StorageBackend>,
}

impl Timeline {
    /// Creates a timeline stored in `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn collection() -> EntityType {
        EntityType::from(TIMELINE_COLLECTION)
    }

    /// Appends an entry.
    pub fn append(&self, entry: &TimelineEntry) -> Result<(), StorageError> {
        let serde_json::Value::Object(mut fields) = serde_json::to_value(entry)? else {
            return Err(StorageError::Serialization("timeline entry is not an object".to_string()));
        };
        fields.remove("id");
        let record = EntityRecord {
            id: Some(entry.id.clone()),
            fields,
        };
        self.backend.create(&Self::collection(), record).map(|_| ())
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> Result<Vec<TimelineEntry>, StorageError> {
        let mut out = self
            .backend
            .get_all(&Self::collection())?
            .into_iter()
            .map(|record| {
                serde_json::from_value(serde_json::Value::Object(record.to_object()))
                    .map_err(|e| StorageError::Corrupt(format!("timeline entry: {e}")))
            })
            .collect::<Result<Vec<TimelineEntry>, _>>()?;
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Entries for one record, oldest first.
    pub fn entries_for(
        &self,
        entity_type: &EntityType,
        ref_id: &RecordId,
    ) -> Result<Vec<TimelineEntry>, StorageError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| &e.entity_type == entity_type && &e.ref_id == ref_id)
            .collect())
    }
}

/// Appends `entry`, logging and swallowing any failure.
///
/// Returns whether the append succeeded so callers can count misses.
pub fn record_best_effort(timeline: &Timeline, entry: &TimelineEntry) -> bool {
    match timeline.append(entry) {
        Ok(()) => true,
        Err(e) => {
            warn!(
                entity_type = %entry.entity_type,
                ref_id = %entry.ref_id,
                action = %entry.action,
                error = %e,
                "timeline append failed"
            );
            false
        }
    }
}
