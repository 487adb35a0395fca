//! Migration reports: counts, per-record failures, and integrity violations.
//!
//! Reports are write-once artifacts. Expected per-record failures are
//! accumulated here instead of being returned as errors. The JSON form uses
//! camelCase keys (`entityCounts`, `errors`, `mode`, ...).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mode::MigrationMode;
use crate::record::{EntityType, RecordId};
use crate::storage::{ErrorClass, StorageError};

/// Which operation produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// Read-only count comparison.
    Assessment,
    /// Copy from legacy to target.
    Migration,
    /// Foreign key, duplicate id, and required field checks.
    Integrity,
    /// Final switch to the target store.
    Cutover,
}

/// Overall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// Nothing went wrong.
    Passed,
    /// At least one error, failure, or violation.
    Failed,
    /// Stopped early by a cancel request.
    Cancelled,
}

/// Record counts for one entity type in each backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityCounts {
    /// Rows in the legacy store.
    pub legacy: usize,
    /// Records in the target store.
    pub target: usize,
}

/// Per-entity-type outcome of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MigrationTally {
    /// Records written to the target.
    pub created: usize,
    /// Records already present in the target from an earlier run.
    pub skipped: usize,
    /// Records that failed to transform or write.
    pub failed: usize,
}

/// Pipeline stage at which a record failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Reading the legacy collection.
    Read,
    /// Applying the mapping rule.
    Transform,
    /// Writing to the target store.
    Write,
}

/// One record that did not make it into the target store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFailure {
    /// Entity type being migrated.
    pub entity_type: EntityType,
    /// Position of the row in the legacy listing.
    pub index: usize,
    /// Target id, when the transform got far enough to have one.
    pub record_id: Option<RecordId>,
    /// Stage that failed.
    pub stage: FailureStage,
    /// Whether retrying may help.
    pub class: ErrorClass,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Error text.
    pub message: String,
}

impl fmt::Display for RecordFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.record_id.as_ref().map_or("?", RecordId::as_str);
        write!(
            f,
            "{}[{}] id={id} {:?}/{:?} after {} attempt(s): {}",
            self.entity_type, self.index, self.stage, self.class, self.attempts, self.message
        )
    }
}

/// A data problem found by integrity validation. Never auto-repaired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityViolation {
    /// A foreign key that does not resolve.
    OrphanedReference {
        /// Referencing type.
        entity_type: EntityType,
        /// Referencing record.
        id: RecordId,
        /// Foreign-key field.
        field: String,
        /// Referenced type.
        references: EntityType,
        /// Dangling value.
        value: String,
    },
    /// An id that occurs more than once within one entity type.
    DuplicateId {
        /// Entity type.
        entity_type: EntityType,
        /// Repeated id.
        id: RecordId,
        /// Number of occurrences.
        occurrences: usize,
    },
    /// A required field that is absent, null, or empty.
    MissingRequiredField {
        /// Entity type.
        entity_type: EntityType,
        /// Offending record.
        id: RecordId,
        /// Missing field.
        field: String,
    },
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrphanedReference {
                entity_type,
                id,
                field,
                references,
                value,
            } => write!(
                f,
                "{entity_type}/{id}: {field}={value} does not resolve to a {references} record"
            ),
            Self::DuplicateId {
                entity_type,
                id,
                occurrences,
            } => write!(f, "{entity_type}/{id}: id appears {occurrences} times"),
            Self::MissingRequiredField {
                entity_type,
                id,
                field,
            } => write!(f, "{entity_type}/{id}: required field '{field}' is missing or empty"),
        }
    }
}

/// Result of an assessment, migration, validation, or cutover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    /// Producing operation.
    pub kind: ReportKind,
    /// Verdict.
    pub status: ReportStatus,
    /// Mode when the report was finished.
    pub mode: MigrationMode,
    /// Counts per entity type in each backend.
    pub entity_counts: BTreeMap<EntityType, EntityCounts>,
    /// Human-readable list of every problem below plus backend errors.
    pub errors: Vec<String>,
    /// Types whose target count is below the legacy count.
    pub shortfalls: Vec<EntityType>,
    /// Legacy types with no mapping rule.
    pub unmapped: Vec<EntityType>,
    /// Per-type migration outcome.
    pub tallies: BTreeMap<EntityType, MigrationTally>,
    /// Records that failed to migrate.
    pub failures: Vec<RecordFailure>,
    /// Integrity violations.
    pub violations: Vec<IntegrityViolation>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Finish time, set by [`MigrationReport::finish`].
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationReport {
    /// Starts an empty report.
    #[must_use]
    pub fn new(kind: ReportKind, mode: MigrationMode) -> Self {
        Self {
            kind,
            status: ReportStatus::Passed,
            mode,
            entity_counts: BTreeMap::new(),
            errors: Vec::new(),
            shortfalls: Vec::new(),
            unmapped: Vec::new(),
            tallies: BTreeMap::new(),
            failures: Vec::new(),
            violations: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Records a backend error that affected a whole entity type.
    pub fn push_backend_error(&mut self, entity_type: &EntityType, context: &str, error: &StorageError) {
        self.errors.push(format!(
            "{entity_type}: {context} failed ({:?}): {error}",
            error.class()
        ));
    }

    /// Records a free-form error.
    pub fn push_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Records a per-record failure.
    pub fn push_failure(&mut self, failure: RecordFailure) {
        self.errors.push(failure.to_string());
        self.tallies.entry(failure.entity_type.clone()).or_default().failed += 1;
        self.failures.push(failure);
    }

    /// Records an integrity violation.
    pub fn push_violation(&mut self, violation: IntegrityViolation) {
        self.errors.push(violation.to_string());
        self.violations.push(violation);
    }

    /// Mutable tally for an entity type.
    pub fn tally_mut(&mut self, entity_type: &EntityType) -> &mut MigrationTally {
        self.tallies.entry(entity_type.clone()).or_default()
    }

    /// Marks the report cancelled.
    pub fn cancel(&mut self) {
        self.status = ReportStatus::Cancelled;
    }

    /// Stamps the finish time and settles the status.
    pub fn finish(&mut self, mode: MigrationMode) {
        self.mode = mode;
        self.finished_at = Some(Utc::now());
        if self.status != ReportStatus::Cancelled {
            self.status = if self.errors.is_empty() {
                ReportStatus::Passed
            } else {
                ReportStatus::Failed
            };
        }
    }

    /// Returns true if the report passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == ReportStatus::Passed
    }

    /// Failures whose class says retrying may help.
    pub fn transient_failures(&self) -> impl Iterator<Item = &RecordFailure> {
        self.failures
            .iter()
            .filter(|f| f.class == ErrorClass::Transient)
    }

    /// Counts for an entity type.
    #[must_use]
    pub fn counts(&self, entity_type: &EntityType) -> EntityCounts {
        self.entity_counts.get(entity_type).copied().unwrap_or_default()
    }
}
