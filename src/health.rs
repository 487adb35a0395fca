//! Read-only diagnostics for dashboards.
//!
//! Nothing here is authoritative state; the report is recomputed per call.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backup::BackupId;
use crate::error::{EngineError, EngineResult};
use crate::migrator::StorageMigrator;
use crate::mode::MigrationMode;
use crate::record::EntityType;
use crate::report::EntityCounts;

/// Snapshot of migration health, serialized with camelCase keys.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Current mode.
    pub mode: MigrationMode,
    /// Counts per entity type in each backend.
    pub entity_counts: BTreeMap<EntityType, EntityCounts>,
    /// Problems found by the assessment and, when transitioning, the integrity check.
    pub errors: Vec<String>,
    /// When the last fully successful migration run finished.
    pub last_migrated_at: Option<DateTime<Utc>>,
    /// Backup armed for the next migration run.
    pub active_backup: Option<BackupId>,
    /// Stored backups.
    pub backup_count: usize,
    /// True when transitioning and integrity validation passes.
    pub ready_for_cutover: bool,
}

/// Builds [`HealthReport`]s from a migrator.
pub struct HealthReporter {
    migrator: Arc<StorageMigrator>,
}

impl HealthReporter {
    /// Creates a reporter.
    #[must_use]
    pub fn new(migrator: Arc<StorageMigrator>) -> Self {
        Self { migrator }
    }

    /// Assesses both stores and summarizes the migration state.
    ///
    /// # Errors
    /// `Storage(Unavailable)` if a backend is offline. Other read failures
    /// land in `errors`.
    pub fn report(&self) -> EngineResult<HealthReport> {
        let assessment = self.migrator.assess_storage_state()?;
        let metadata = self.migrator.metadata();
        let mut errors = assessment.errors;

        let backup_count = match self.migrator.list_backups() {
            Ok(backups) => backups.len(),
            Err(e) => {
                errors.push(format!("listing backups failed: {e}"));
                0
            }
        };

        let ready_for_cutover = if metadata.mode == MigrationMode::Transitioning {
            let integrity = self.migrator.validate_integrity()?;
            let ready = integrity.passed();
            errors.extend(integrity.errors);
            ready
        } else {
            false
        };

        Ok(HealthReport {
            mode: metadata.mode,
            entity_counts: assessment.entity_counts,
            errors,
            last_migrated_at: metadata.last_migrated_at,
            active_backup: metadata.active_backup,
            backup_count,
            ready_for_cutover,
        })
    }

    /// The report as a JSON value.
    ///
    /// # Errors
    /// Same as [`HealthReporter::report`].
    pub fn report_json(&self) -> EngineResult<serde_json::Value> {
        let report = self.report()?;
        serde_json::to_value(report)
            .map_err(|e| EngineError::internal(format!("health report serialization: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigratorConfig;
    use crate::mapping::MappingTable;
    use crate::record::EntityRecord;
    use crate::storage::{InMemoryBackend, StorageBackend};
    use serde_json::json;

    fn reporter() -> (Arc<StorageMigrator>, HealthReporter) {
        let legacy = Arc::new(InMemoryBackend::named("legacy"));
        legacy
            .create(&EntityType::Clients, EntityRecord::with_id("c1").field("name", "Acme"))
            .unwrap();
        let migrator = Arc::new(
            StorageMigrator::new(
                legacy,
                Arc::new(InMemoryBackend::new()),
                Arc::new(InMemoryBackend::named("system")),
                MappingTable::standard(),
                MigratorConfig::default(),
            )
            .unwrap(),
        );
        (Arc::clone(&migrator), HealthReporter::new(migrator))
    }

    #[test]
    fn test_report_before_migration() {
        let (_, reporter) = reporter();
        let report = reporter.report().unwrap();
        assert_eq!(report.mode, MigrationMode::Legacy);
        assert_eq!(report.entity_counts[&EntityType::Clients], EntityCounts { legacy: 1, target: 0 });
        assert!(!report.ready_for_cutover);
        assert_eq!(report.backup_count, 0);
    }

    #[test]
    fn test_ready_after_clean_migration() {
        let (migrator, reporter) = reporter();
        migrator.create_backup().unwrap();
        migrator.migrate_from_local_storage().unwrap();

        let report = reporter.report().unwrap();
        assert_eq!(report.mode, MigrationMode::Transitioning);
        assert!(report.ready_for_cutover, "{:?}", report.errors);
        assert!(report.active_backup.is_some());
        assert_eq!(report.backup_count, 1);
    }

    #[test]
    fn test_json_shape() {
        let (_, reporter) = reporter();
        let v = reporter.report_json().unwrap();
        assert_eq!(v["mode"], json!("legacy"));
        assert_eq!(v["entityCounts"]["clients"]["legacy"], json!(1));
        assert!(v["errors"].is_array());
        assert_eq!(v["readyForCutover"], json!(false));
    }
}
