//! The storage migrator: assessment, backup, copy, validation, and rollback.
//!
//! The migrator is the only component that changes the migration mode. Each
//! operation can be invoked on its own and retried. Per-record problems are
//! collected into a [`MigrationReport`]; only precondition failures and an
//! unavailable backend are returned as errors.
//!
//! A migration run walks entity types strictly in dependency order. Inside
//! one type, writes can fan out over `record_workers` threads; results are
//! reassembled in legacy order before they are reported.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use crossbeam_channel::bounded;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backup::{BackupId, BackupSnapshot, BackupSummary, BackupVault};
use crate::config::MigratorConfig;
use crate::error::{EngineError, EngineResult, PreconditionError};
use crate::mapping::MappingTable;
use crate::mode::{MigrationMetadata, MigrationMode, MigrationStateMachine};
use crate::record::{EntityRecord, EntityType, RecordId};
use crate::report::{
    EntityCounts, FailureStage, IntegrityViolation, MigrationReport, RecordFailure, ReportKind,
    ReportStatus,
};
use crate::storage::{ErrorClass, StorageBackend, StorageError};

/// Cooperative cancellation for a migration run.
///
/// The run checks the flag between entity types. A cancel issued while no
/// run is active applies to the next run. The flag clears when a run ends.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true if cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// What a rollback did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    /// Backup that was restored.
    pub backup: BackupId,
    /// Records written back per entity type.
    pub restored: BTreeMap<EntityType, usize>,
    /// Mode before the rollback.
    pub previous_mode: MigrationMode,
}

/// Clears the in-progress flag when an operation ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> EngineResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PreconditionError::MigrationInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Outcome of writing one record, retries included.
struct WriteOutcome {
    result: Result<EntityRecord, StorageError>,
    attempts: u32,
}

/// A transformed record waiting to be written.
struct Pending {
    index: usize,
    record: EntityRecord,
}

/// Moves data from the legacy store to the target store.
pub struct StorageMigrator {
    legacy: Arc<dyn StorageBackend>,
    target: Arc<dyn StorageBackend>,
    mapping: Arc<MappingTable>,
    state: Arc<MigrationStateMachine>,
    vault: BackupVault,
    config: MigratorConfig,
    running: AtomicBool,
    cancel: CancelHandle,
}

impl StorageMigrator {
    /// Creates a migrator.
    ///
    /// `system` holds the migration metadata and backups; it may be the
    /// target backend itself.
    ///
    /// # Errors
    /// - `Config` if `config` is invalid
    /// - `Storage` if the persisted metadata cannot be read
    pub fn new(
        legacy: Arc<dyn StorageBackend>,
        target: Arc<dyn StorageBackend>,
        system: Arc<dyn StorageBackend>,
        mapping: MappingTable,
        config: MigratorConfig,
    ) -> EngineResult<Self> {
        let config = config.validate()?;
        let state = Arc::new(MigrationStateMachine::open(Arc::clone(&system))?);
        Ok(Self {
            legacy,
            target,
            mapping: Arc::new(mapping),
            state,
            vault: BackupVault::new(system),
            config,
            running: AtomicBool::new(false),
            cancel: CancelHandle::default(),
        })
    }

    /// Shared state machine, for wiring a [`UnifiedStore`](crate::unified::UnifiedStore).
    #[must_use]
    pub fn state(&self) -> &Arc<MigrationStateMachine> {
        &self.state
    }

    /// Shared mapping table.
    #[must_use]
    pub fn mapping(&self) -> &Arc<MappingTable> {
        &self.mapping
    }

    /// Legacy backend.
    #[must_use]
    pub fn legacy(&self) -> &Arc<dyn StorageBackend> {
        &self.legacy
    }

    /// Target backend.
    #[must_use]
    pub fn target(&self) -> &Arc<dyn StorageBackend> {
        &self.target
    }

    /// Handle for cancelling a running migration.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Current mode.
    #[must_use]
    pub fn get_migration_mode(&self) -> MigrationMode {
        self.state.current_mode()
    }

    /// Persisted migration metadata.
    #[must_use]
    pub fn metadata(&self) -> MigrationMetadata {
        self.state.metadata()
    }

    /// Legacy entity types outside the reserved namespace, or the read error.
    fn legacy_types(&self) -> Result<Vec<EntityType>, StorageError> {
        Ok(self
            .legacy
            .entity_types()?
            .into_iter()
            .filter(|t| !t.is_reserved())
            .collect())
    }

    /// Dependency order followed by legacy types without a rule, sorted.
    fn migration_order(&self, legacy_types: &[EntityType]) -> Vec<EntityType> {
        let mut order = self.mapping.dependency_order().to_vec();
        let extra: BTreeSet<&EntityType> = legacy_types
            .iter()
            .filter(|t| !self.mapping.contains(t))
            .collect();
        order.extend(extra.into_iter().cloned());
        order
    }

    /// Compares record counts in both backends. Never mutates anything.
    ///
    /// # Errors
    /// `Storage(Unavailable)` if a backend is offline. Other read failures
    /// are recorded in the report.
    pub fn assess_storage_state(&self) -> EngineResult<MigrationReport> {
        let mut report = MigrationReport::new(ReportKind::Assessment, self.state.current_mode());

        let legacy_types = match self.legacy_types() {
            Ok(types) => types,
            Err(e) if e.is_catastrophic() => return Err(e.into()),
            Err(e) => {
                report.push_error(format!("listing legacy entity types failed: {e}"));
                Vec::new()
            }
        };

        for entity_type in self.migration_order(&legacy_types) {
            let legacy = match self.legacy.count(&entity_type) {
                Ok(n) => n,
                Err(e) if e.is_catastrophic() => return Err(e.into()),
                Err(e) => {
                    report.push_backend_error(&entity_type, "legacy count", &e);
                    continue;
                }
            };
            let target = match self.target.count(&entity_type) {
                Ok(n) => n,
                Err(e) if e.is_catastrophic() => return Err(e.into()),
                Err(e) => {
                    report.push_backend_error(&entity_type, "target count", &e);
                    continue;
                }
            };

            if target < legacy {
                report.shortfalls.push(entity_type.clone());
            }
            if legacy > 0 && !self.mapping.contains(&entity_type) {
                report.unmapped.push(entity_type.clone());
            }
            report
                .entity_counts
                .insert(entity_type, EntityCounts { legacy, target });
        }

        report.finish(self.state.current_mode());
        debug!(
            shortfalls = report.shortfalls.len(),
            unmapped = report.unmapped.len(),
            "storage assessed"
        );
        Ok(report)
    }

    /// Snapshots the legacy store and arms the snapshot for the next run.
    ///
    /// # Errors
    /// - `MigrationInProgress` while a run is active
    /// - `Storage` if the snapshot cannot be read or stored; nothing is armed
    pub fn create_backup(&self) -> EngineResult<BackupSnapshot> {
        let _guard = RunGuard::acquire(&self.running)?;
        let snapshot = self
            .vault
            .capture(self.legacy.as_ref(), self.mapping.dependency_order())?;
        let id = snapshot.id.clone();
        self.state.modify(|meta| {
            meta.active_backup = Some(id);
            Ok(())
        })?;
        Ok(snapshot)
    }

    /// Lists stored backups, oldest first.
    ///
    /// # Errors
    /// `Storage` if the backup collection cannot be read.
    pub fn list_backups(&self) -> EngineResult<Vec<BackupSummary>> {
        Ok(self.vault.list()?)
    }

    /// Deletes a backup. Disarms it if it was armed.
    ///
    /// # Errors
    /// `Storage(NotFound)` if no such backup exists.
    pub fn discard_backup(&self, id: &BackupId) -> EngineResult<()> {
        self.vault.discard(id)?;
        self.state.modify(|meta| {
            if meta.active_backup.as_ref() == Some(id) {
                meta.active_backup = None;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Copies every legacy record into the target store.
    ///
    /// Entity types are processed in dependency order, each record
    /// transformed and written independently. Records already present in
    /// the target from an earlier run are counted as skipped. When every
    /// record succeeds and the mode is `Legacy`, the mode advances to
    /// `Transitioning`; otherwise the mode is left alone.
    ///
    /// # Errors
    /// - `BackupRequired` if no backup is armed
    /// - `InvalidTransition` once the mode is `Modern`
    /// - `MigrationInProgress` if another run is active
    /// - `Storage(Unavailable)` if a backend goes offline mid-run
    pub fn migrate_from_local_storage(&self) -> EngineResult<MigrationReport> {
        let _guard = RunGuard::acquire(&self.running)?;
        let result = self.run_migration();
        self.cancel.reset();
        result
    }

    fn run_migration(&self) -> EngineResult<MigrationReport> {
        let metadata = self.state.metadata();
        let Some(backup) = metadata.active_backup else {
            return Err(PreconditionError::BackupRequired.into());
        };
        // After cutover the legacy rows are stale; copying them again would
        // bring back records deleted in the target.
        if metadata.mode == MigrationMode::Modern {
            return Err(PreconditionError::InvalidTransition {
                from: MigrationMode::Modern,
                to: MigrationMode::Transitioning,
            }
            .into());
        }

        let mut report = MigrationReport::new(ReportKind::Migration, metadata.mode);
        info!(backup = %backup, mode = %metadata.mode, "migration started");

        let legacy_types = match self.legacy_types() {
            Ok(types) => types,
            Err(e) if e.is_catastrophic() => return Err(e.into()),
            Err(e) => {
                report.push_error(format!("listing legacy entity types failed: {e}"));
                Vec::new()
            }
        };

        for entity_type in self.migration_order(&legacy_types) {
            if self.cancel.is_cancelled() {
                info!(next = %entity_type, "migration cancelled");
                report.cancel();
                break;
            }
            if !self.mapping.contains(&entity_type) {
                report.unmapped.push(entity_type.clone());
            }
            self.migrate_entity_type(&entity_type, &mut report)?;
        }

        if report.status != ReportStatus::Cancelled && report.errors.is_empty() {
            self.state.modify(|meta| {
                if meta.mode == MigrationMode::Legacy {
                    meta.mode = MigrationMode::Transitioning;
                }
                meta.last_migrated_at = Some(Utc::now());
                Ok(())
            })?;
        }

        report.finish(self.state.current_mode());
        info!(
            status = ?report.status,
            failures = report.failures.len(),
            mode = %report.mode,
            "migration finished"
        );
        Ok(report)
    }

    fn migrate_entity_type(&self, entity_type: &EntityType, report: &mut MigrationReport) -> EngineResult<()> {
        let rows = match self.legacy.get_all(entity_type) {
            Ok(rows) => rows,
            Err(e) if e.is_catastrophic() => return Err(e.into()),
            Err(e) => {
                report.push_backend_error(entity_type, "legacy read", &e);
                return Ok(());
            }
        };

        let mut seen: HashSet<RecordId> = HashSet::with_capacity(rows.len());
        let mut pending = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            let record = match self.mapping.transform(entity_type, row) {
                Ok(record) => record,
                Err(e) => {
                    warn!(entity_type = %entity_type, index, error = %e, "transform failed");
                    report.push_failure(RecordFailure {
                        entity_type: entity_type.clone(),
                        index,
                        record_id: row.id.clone(),
                        stage: FailureStage::Transform,
                        class: ErrorClass::Permanent,
                        attempts: 1,
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            let Some(id) = record.id.clone() else {
                return Err(EngineError::internal("transform produced a record without an id"));
            };
            if !seen.insert(id.clone()) {
                let err = StorageError::duplicate(entity_type, &id);
                warn!(entity_type = %entity_type, index, id = %id, "duplicate id within run");
                report.push_failure(RecordFailure {
                    entity_type: entity_type.clone(),
                    index,
                    record_id: Some(id),
                    stage: FailureStage::Write,
                    class: ErrorClass::Permanent,
                    attempts: 0,
                    message: err.to_string(),
                });
                continue;
            }
            pending.push(Pending { index, record });
        }

        for batch in pending.chunks(self.config.batch_size) {
            let outcomes = if self.config.record_workers > 1 {
                self.write_parallel(entity_type, batch)?
            } else {
                self.write_sequential(entity_type, batch)
            };
            for (item, outcome) in batch.iter().zip(outcomes) {
                self.settle(entity_type, item, outcome, report)?;
            }
        }

        let target = match self.target.count(entity_type) {
            Ok(n) => n,
            Err(e) if e.is_catastrophic() => return Err(e.into()),
            Err(e) => {
                report.push_backend_error(entity_type, "target count", &e);
                0
            }
        };
        report.entity_counts.insert(
            entity_type.clone(),
            EntityCounts {
                legacy: rows.len(),
                target,
            },
        );
        let tally = *report.tally_mut(entity_type);
        debug!(
            entity_type = %entity_type,
            created = tally.created,
            skipped = tally.skipped,
            failed = tally.failed,
            "entity type migrated"
        );
        Ok(())
    }

    /// Folds one write outcome into the report.
    fn settle(
        &self,
        entity_type: &EntityType,
        item: &Pending,
        outcome: WriteOutcome,
        report: &mut MigrationReport,
    ) -> EngineResult<()> {
        match outcome.result {
            Ok(_) => report.tally_mut(entity_type).created += 1,
            // Written by an earlier run; the transform is deterministic.
            Err(StorageError::DuplicateKey { .. }) => report.tally_mut(entity_type).skipped += 1,
            Err(e) if e.is_catastrophic() => {
                warn!(entity_type = %entity_type, error = %e, "target unavailable; aborting run");
                return Err(e.into());
            }
            Err(e) => {
                warn!(
                    entity_type = %entity_type,
                    index = item.index,
                    attempts = outcome.attempts,
                    error = %e,
                    "record write failed"
                );
                report.push_failure(RecordFailure {
                    entity_type: entity_type.clone(),
                    index: item.index,
                    record_id: item.record.id.clone(),
                    stage: FailureStage::Write,
                    class: e.class(),
                    attempts: outcome.attempts,
                    message: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// One `bulk_create` for the batch, then per-record retries of transient failures.
    fn write_sequential(&self, entity_type: &EntityType, batch: &[Pending]) -> Vec<WriteOutcome> {
        let records = batch.iter().map(|p| p.record.clone()).collect();
        let results = self.target.bulk_create(entity_type, records);
        batch
            .iter()
            .zip(results)
            .map(|(item, result)| match result {
                Ok(record) => WriteOutcome {
                    result: Ok(record),
                    attempts: 1,
                },
                Err(e) => self.retry_create(entity_type, &item.record, 1, e),
            })
            .collect()
    }

    /// Fans the batch out over worker threads and returns outcomes in batch order.
    fn write_parallel(&self, entity_type: &EntityType, batch: &[Pending]) -> EngineResult<Vec<WriteOutcome>> {
        let capacity = batch.len().max(1);
        let workers = self.config.record_workers.min(capacity);
        let (job_tx, job_rx) = bounded::<(usize, &Pending)>(capacity);
        let (out_tx, out_rx) = bounded::<(usize, WriteOutcome)>(capacity);

        for job in batch.iter().enumerate() {
            job_tx
                .send(job)
                .map_err(|_| EngineError::internal("migration job queue closed"))?;
        }
        drop(job_tx);

        thread::scope(|scope| -> EngineResult<()> {
            for idx in 0..workers {
                let rx = job_rx.clone();
                let tx = out_tx.clone();
                thread::Builder::new()
                    .name(format!("dualstore-migrate-{idx}"))
                    .spawn_scoped(scope, move || {
                        for (slot, item) in rx.iter() {
                            let outcome = match self.target.create(entity_type, item.record.clone()) {
                                Ok(record) => WriteOutcome {
                                    result: Ok(record),
                                    attempts: 1,
                                },
                                Err(e) => self.retry_create(entity_type, &item.record, 1, e),
                            };
                            if tx.send((slot, outcome)).is_err() {
                                break;
                            }
                        }
                    })
                    .map_err(|e| EngineError::internal(format!("failed to spawn migration worker: {e}")))?;
            }
            Ok(())
        })?;
        drop(out_tx);

        let mut results: Vec<(usize, WriteOutcome)> = out_rx.iter().collect();
        if results.len() != batch.len() {
            return Err(EngineError::internal(format!(
                "migration workers returned {} of {} outcomes",
                results.len(),
                batch.len()
            )));
        }
        results.sort_by_key(|(slot, _)| *slot);
        Ok(results.into_iter().map(|(_, outcome)| outcome).collect())
    }

    /// Retries a transient create failure per the retry policy.
    ///
    /// A record still failing after `max_attempts` keeps its transient class.
    fn retry_create(
        &self,
        entity_type: &EntityType,
        record: &EntityRecord,
        mut attempts: u32,
        mut last: StorageError,
    ) -> WriteOutcome {
        let policy = &self.config.retry;
        while last.is_transient() && !last.is_catastrophic() && attempts < policy.max_attempts {
            let delay = policy.backoff(attempts);
            warn!(
                entity_type = %entity_type,
                id = ?record.id.as_ref().map(RecordId::as_str),
                attempt = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %last,
                "transient write failure; retrying"
            );
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            attempts += 1;
            match self.target.create(entity_type, record.clone()) {
                Ok(created) => {
                    return WriteOutcome {
                        result: Ok(created),
                        attempts,
                    }
                }
                Err(e) => last = e,
            }
        }
        WriteOutcome {
            result: Err(last),
            attempts,
        }
    }

    /// Checks foreign keys, duplicate ids, and required fields in the target.
    ///
    /// Violations are reported, never repaired.
    ///
    /// # Errors
    /// `Storage(Unavailable)` if the target is offline.
    pub fn validate_integrity(&self) -> EngineResult<MigrationReport> {
        let mut report = MigrationReport::new(ReportKind::Integrity, self.state.current_mode());
        self.check_integrity(&mut report)?;
        report.finish(self.state.current_mode());
        info!(
            violations = report.violations.len(),
            status = ?report.status,
            "integrity validated"
        );
        Ok(report)
    }

    fn check_integrity(&self, report: &mut MigrationReport) -> EngineResult<()> {
        let legacy_types = match self.legacy_types() {
            Ok(types) => types,
            Err(e) if e.is_catastrophic() => return Err(e.into()),
            Err(e) => {
                report.push_error(format!("listing legacy entity types failed: {e}"));
                Vec::new()
            }
        };

        let mut loaded: BTreeMap<EntityType, Vec<EntityRecord>> = BTreeMap::new();
        for entity_type in self.migration_order(&legacy_types) {
            match self.target.get_all(&entity_type) {
                Ok(records) => {
                    loaded.insert(entity_type, records);
                }
                Err(e) if e.is_catastrophic() => return Err(e.into()),
                Err(e) => report.push_backend_error(&entity_type, "target read", &e),
            }
        }

        let ids: HashMap<&EntityType, HashSet<&str>> = loaded
            .iter()
            .map(|(t, records)| {
                let set = records
                    .iter()
                    .filter_map(|r| r.id.as_ref().map(RecordId::as_str))
                    .collect();
                (t, set)
            })
            .collect();

        for (entity_type, records) in &loaded {
            let legacy = match self.legacy.count(entity_type) {
                Ok(n) => n,
                Err(e) if e.is_catastrophic() => return Err(e.into()),
                Err(e) => {
                    report.push_backend_error(entity_type, "legacy count", &e);
                    0
                }
            };
            report.entity_counts.insert(
                entity_type.clone(),
                EntityCounts {
                    legacy,
                    target: records.len(),
                },
            );

            let mut occurrences: BTreeMap<&RecordId, usize> = BTreeMap::new();
            for id in records.iter().filter_map(|r| r.id.as_ref()) {
                *occurrences.entry(id).or_default() += 1;
            }
            for (id, count) in occurrences.into_iter().filter(|(_, n)| *n > 1) {
                report.push_violation(IntegrityViolation::DuplicateId {
                    entity_type: entity_type.clone(),
                    id: id.clone(),
                    occurrences: count,
                });
            }

            let Some(rule) = self.mapping.rule(entity_type) else {
                continue;
            };
            for record in records {
                let id = record.id.clone().unwrap_or_else(|| RecordId::new(""));
                for field in &rule.required {
                    if record.get(field).map_or(true, is_empty_value) {
                        report.push_violation(IntegrityViolation::MissingRequiredField {
                            entity_type: entity_type.clone(),
                            id: id.clone(),
                            field: field.clone(),
                        });
                    }
                }
                for fk in &rule.foreign_keys {
                    let Some(known) = ids.get(&fk.references) else {
                        continue;
                    };
                    let values = record.get(&fk.field).map(reference_values).unwrap_or_default();
                    for value in values.into_iter().filter(|v| !known.contains(v.as_str())) {
                        report.push_violation(IntegrityViolation::OrphanedReference {
                            entity_type: entity_type.clone(),
                            id: id.clone(),
                            field: fk.field.clone(),
                            references: fk.references.clone(),
                            value,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Restores the most recent backup into the legacy store and returns to `Legacy`.
    ///
    /// Target data is left in place. The armed backup is disarmed, so the
    /// next migration needs a fresh one.
    ///
    /// # Errors
    /// - `NoBackupAvailable` if no backup exists
    /// - `MigrationInProgress` if a run is active
    /// - `Storage` if the backup is corrupt or the restore fails; the mode is unchanged
    pub fn rollback_to_legacy(&self) -> EngineResult<RollbackOutcome> {
        let _guard = RunGuard::acquire(&self.running)?;
        let Some(snapshot) = self.vault.latest()? else {
            return Err(PreconditionError::NoBackupAvailable.into());
        };
        let previous_mode = self.state.current_mode();
        info!(backup = %snapshot.id, from = %previous_mode, "rollback started");

        let restored = self.vault.restore(&snapshot, self.legacy.as_ref())?;
        self.state.modify(|meta| {
            meta.mode = MigrationMode::Legacy;
            meta.active_backup = None;
            meta.last_rollback_at = Some(Utc::now());
            Ok(())
        })?;

        info!(backup = %snapshot.id, records = snapshot.record_count(), "rollback finished");
        Ok(RollbackOutcome {
            backup: snapshot.id,
            restored,
            previous_mode,
        })
    }

    /// Advances `Transitioning -> Modern` once integrity validation passes.
    ///
    /// Calling it again in `Modern` revalidates and keeps the mode.
    ///
    /// # Errors
    /// - `InvalidTransition` from `Legacy`
    /// - `IntegrityCheckFailed` if validation reports any problem; mode unchanged
    /// - `MigrationInProgress` if a run is active
    pub fn complete_cutover(&self) -> EngineResult<MigrationReport> {
        let _guard = RunGuard::acquire(&self.running)?;
        let from = self.state.current_mode();
        if from == MigrationMode::Legacy {
            return Err(PreconditionError::InvalidTransition {
                from,
                to: MigrationMode::Modern,
            }
            .into());
        }

        let mut report = MigrationReport::new(ReportKind::Cutover, from);
        self.check_integrity(&mut report)?;
        if !report.errors.is_empty() {
            warn!(problems = report.errors.len(), "cutover refused");
            return Err(PreconditionError::IntegrityCheckFailed {
                violations: report.errors.len(),
            }
            .into());
        }

        let mode = self.state.advance(MigrationMode::Modern)?;
        report.finish(mode);
        info!("cutover complete");
        Ok(report)
    }
}

/// Null, blank strings, and empty containers count as missing.
fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Non-empty reference values held by a foreign-key field.
fn reference_values(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) if !s.is_empty() => vec![s.clone()],
        Value::Number(n) => vec![n.to_string()],
        Value::Array(items) => items.iter().flat_map(reference_values).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::storage::{FaultyBackend, InMemoryBackend, KeyValueBackend, MemoryKeyValueStore};

    fn legacy() -> Arc<KeyValueBackend<MemoryKeyValueStore>> {
        let kv = KeyValueBackend::new(MemoryKeyValueStore::new());
        kv.create(&EntityType::Clients, EntityRecord::with_id("c1").field("fullName", "Acme"))
            .unwrap();
        kv.create(&EntityType::Clients, EntityRecord::with_id("c2").field("fullName", "Beta"))
            .unwrap();
        kv.create(
            &EntityType::Cases,
            EntityRecord::with_id("k1").field("caseTitle", "Lease").field("clientId", "c1"),
        )
        .unwrap();
        Arc::new(kv)
    }

    fn migrator_with(
        legacy: Arc<dyn StorageBackend>,
        target: Arc<dyn StorageBackend>,
        config: MigratorConfig,
    ) -> StorageMigrator {
        StorageMigrator::new(
            legacy,
            target,
            Arc::new(InMemoryBackend::named("system")),
            MappingTable::standard(),
            config,
        )
        .unwrap()
    }

    fn migrator() -> StorageMigrator {
        migrator_with(legacy(), Arc::new(InMemoryBackend::new()), MigratorConfig::default())
    }

    #[test]
    fn test_migrate_requires_backup() {
        let m = migrator();
        let err = m.migrate_from_local_storage().unwrap_err();
        assert!(matches!(
            err,
            EngineError::Precondition(PreconditionError::BackupRequired)
        ));
        assert_eq!(m.target().count(&EntityType::Clients).unwrap(), 0);
    }

    #[test]
    fn test_assessment_counts_and_shortfalls() {
        let m = migrator();
        let report = m.assess_storage_state().unwrap();
        assert_eq!(report.counts(&EntityType::Clients), EntityCounts { legacy: 2, target: 0 });
        assert!(report.shortfalls.contains(&EntityType::Cases));
        assert!(report.passed());
    }

    #[test]
    fn test_full_run_advances_mode() {
        let m = migrator();
        m.create_backup().unwrap();
        let report = m.migrate_from_local_storage().unwrap();

        assert!(report.passed(), "{:?}", report.errors);
        assert_eq!(report.tallies[&EntityType::Clients].created, 2);
        assert_eq!(m.get_migration_mode(), MigrationMode::Transitioning);
        assert!(m.metadata().last_migrated_at.is_some());

        let case = m.target().get_by_id(&EntityType::Cases, &"k1".into()).unwrap();
        assert_eq!(case.get("client_id"), Some(&Value::from("c1")));
        assert_eq!(case.get("title"), Some(&Value::from("Lease")));
    }

    #[test]
    fn test_rerun_skips_existing_records() {
        let m = migrator();
        m.create_backup().unwrap();
        m.migrate_from_local_storage().unwrap();
        let again = m.migrate_from_local_storage().unwrap();

        assert!(again.passed());
        assert_eq!(again.tallies[&EntityType::Clients].created, 0);
        assert_eq!(again.tallies[&EntityType::Clients].skipped, 2);
        assert_eq!(m.target().count(&EntityType::Clients).unwrap(), 2);
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let target = Arc::new(FaultyBackend::new(Arc::new(InMemoryBackend::new())));
        target.fail_create_transiently("c2", 2);
        let config = MigratorConfig {
            retry: RetryPolicy::immediate(3),
            ..MigratorConfig::default()
        };
        let m = migrator_with(legacy(), target, config);
        m.create_backup().unwrap();

        let report = m.migrate_from_local_storage().unwrap();
        assert!(report.passed(), "{:?}", report.errors);
        assert_eq!(m.target().count(&EntityType::Clients).unwrap(), 2);
    }

    #[test]
    fn test_exhausted_retries_stay_transient_and_hold_mode() {
        let target = Arc::new(FaultyBackend::new(Arc::new(InMemoryBackend::new())));
        target.fail_create_transiently("c2", 10);
        let config = MigratorConfig {
            retry: RetryPolicy::immediate(2),
            ..MigratorConfig::default()
        };
        let m = migrator_with(legacy(), target, config);
        m.create_backup().unwrap();

        let report = m.migrate_from_local_storage().unwrap();
        assert_eq!(report.status, ReportStatus::Failed);
        let failure = &report.failures[0];
        assert_eq!(failure.class, ErrorClass::Transient);
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.record_id, Some("c2".into()));
        assert_eq!(m.get_migration_mode(), MigrationMode::Legacy);
    }

    #[test]
    fn test_parallel_workers_match_sequential() {
        let config = MigratorConfig {
            record_workers: 4,
            batch_size: 1,
            ..MigratorConfig::default()
        };
        let m = migrator_with(legacy(), Arc::new(InMemoryBackend::new()), config);
        m.create_backup().unwrap();
        let report = m.migrate_from_local_storage().unwrap();
        assert!(report.passed(), "{:?}", report.errors);
        assert_eq!(report.counts(&EntityType::Clients), EntityCounts { legacy: 2, target: 2 });
        assert_eq!(report.counts(&EntityType::Cases), EntityCounts { legacy: 1, target: 1 });
    }

    #[test]
    fn test_unavailable_target_propagates() {
        let target = Arc::new(FaultyBackend::new(Arc::new(InMemoryBackend::new())));
        let m = migrator_with(legacy(), target.clone(), MigratorConfig::default());
        m.create_backup().unwrap();
        target.set_unavailable(true);

        let err = m.migrate_from_local_storage().unwrap_err();
        assert!(matches!(err, EngineError::Storage(StorageError::Unavailable(_))));
        assert_eq!(m.get_migration_mode(), MigrationMode::Legacy);
    }

    #[test]
    fn test_cancel_before_run_stops_at_first_type() {
        let m = migrator();
        m.create_backup().unwrap();
        let handle = m.cancel_handle();
        handle.cancel();

        let report = m.migrate_from_local_storage().unwrap();
        assert_eq!(report.status, ReportStatus::Cancelled);
        assert_eq!(m.get_migration_mode(), MigrationMode::Legacy);
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn test_integrity_flags_orphans_and_missing_fields() {
        let target = Arc::new(InMemoryBackend::new());
        target
            .create(&EntityType::Clients, EntityRecord::with_id("c1").field("name", ""))
            .unwrap();
        target
            .create(
                &EntityType::Cases,
                EntityRecord::with_id("k1").field("client_id", "ghost"),
            )
            .unwrap();
        let m = migrator_with(legacy(), target, MigratorConfig::default());

        let report = m.validate_integrity().unwrap();
        assert_eq!(report.status, ReportStatus::Failed);
        assert!(report.violations.contains(&IntegrityViolation::MissingRequiredField {
            entity_type: EntityType::Clients,
            id: "c1".into(),
            field: "name".to_string(),
        }));
        assert!(report.violations.iter().any(|v| matches!(
            v,
            IntegrityViolation::OrphanedReference { value, .. } if value == "ghost"
        )));
    }

    #[test]
    fn test_integrity_covers_unmapped_types() {
        let legacy = legacy();
        let notes = EntityType::from("notes");
        legacy.create(&notes, EntityRecord::with_id("n1").field("body", "call back")).unwrap();
        let m = migrator_with(legacy, Arc::new(InMemoryBackend::new()), MigratorConfig::default());
        m.create_backup().unwrap();
        m.migrate_from_local_storage().unwrap();

        let report = m.validate_integrity().unwrap();
        assert!(report.passed(), "{:?}", report.errors);
        assert_eq!(report.counts(&notes), EntityCounts { legacy: 1, target: 1 });
    }

    #[test]
    fn test_integrity_reports_legacy_read_failure() {
        let legacy = Arc::new(FaultyBackend::new(legacy()));
        let m = migrator_with(legacy.clone(), Arc::new(InMemoryBackend::new()), MigratorConfig::default());
        legacy.fail_reads(Some(StorageError::Busy("legacy locked".to_string())));

        let report = m.validate_integrity().unwrap();
        assert_eq!(report.status, ReportStatus::Failed);
        assert!(report.errors.iter().any(|e| e.contains("legacy count")), "{:?}", report.errors);

        legacy.set_unavailable(true);
        let err = m.validate_integrity().unwrap_err();
        assert!(matches!(err, EngineError::Storage(StorageError::Unavailable(_))));
    }

    #[test]
    fn test_rerun_after_cutover_is_rejected() {
        let m = migrator();
        m.create_backup().unwrap();
        m.migrate_from_local_storage().unwrap();
        m.complete_cutover().unwrap();
        m.target().delete(&EntityType::Clients, &"c1".into()).unwrap();

        let err = m.migrate_from_local_storage().unwrap_err();
        assert!(matches!(
            err,
            EngineError::Precondition(PreconditionError::InvalidTransition {
                from: MigrationMode::Modern,
                ..
            })
        ));
        assert_eq!(m.target().count(&EntityType::Clients).unwrap(), 1);
        assert!(m.target().get_by_id(&EntityType::Clients, &"c1".into()).is_err());
        assert_eq!(m.get_migration_mode(), MigrationMode::Modern);
    }

    #[test]
    fn test_rollback_without_backup() {
        let m = migrator();
        let err = m.rollback_to_legacy().unwrap_err();
        assert!(matches!(
            err,
            EngineError::Precondition(PreconditionError::NoBackupAvailable)
        ));
    }

    #[test]
    fn test_rollback_disarms_backup() {
        let m = migrator();
        m.create_backup().unwrap();
        m.migrate_from_local_storage().unwrap();

        let outcome = m.rollback_to_legacy().unwrap();
        assert_eq!(outcome.previous_mode, MigrationMode::Transitioning);
        assert_eq!(outcome.restored[&EntityType::Clients], 2);
        assert_eq!(m.get_migration_mode(), MigrationMode::Legacy);
        assert!(m.metadata().active_backup.is_none());
        assert!(m.metadata().last_rollback_at.is_some());
        // Target left for inspection.
        assert_eq!(m.target().count(&EntityType::Clients).unwrap(), 2);

        let err = m.migrate_from_local_storage().unwrap_err();
        assert!(matches!(
            err,
            EngineError::Precondition(PreconditionError::BackupRequired)
        ));
    }

    #[test]
    fn test_cutover_requires_transitioning() {
        let m = migrator();
        let err = m.complete_cutover().unwrap_err();
        assert!(matches!(
            err,
            EngineError::Precondition(PreconditionError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_discard_active_backup_disarms() {
        let m = migrator();
        let snapshot = m.create_backup().unwrap();
        assert_eq!(m.list_backups().unwrap().len(), 1);

        m.discard_backup(&snapshot.id).unwrap();
        assert!(m.list_backups().unwrap().is_empty());
        assert!(m.metadata().active_backup.is_none());
    }

    #[test]
    fn test_helpers() {
        assert!(is_empty_value(&Value::from("  ")));
        assert!(!is_empty_value(&Value::from(0)));
        assert_eq!(
            reference_values(&serde_json::json!(["a", 2, null])),
            vec!["a".to_string(), "2".to_string()]
        );
    }
}
