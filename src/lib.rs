//! # dualstore - Storage Consolidation Engine
//!
//! dualstore moves an application's entities out of a flat legacy key-value
//! store and into a structured store without downtime. While the move is in
//! flight, reads and writes go through a dual-write facade, so either store
//! can serve as the source of truth until cutover.
//!
//! ## Core Concepts
//!
//! - **Mode**: `legacy` → `transitioning` → `modern`, persisted in the system store
//! - **Mapping**: per-entity-type field renames, defaults, dates, and foreign keys
//! - **Backup**: checksummed snapshot of the legacy store, required before migrating
//! - **Report**: every assessment, run, and integrity check ends in a [`MigrationReport`]
//! - **Unified store**: mode-aware CRUD with legacy fallback and best-effort mirroring
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dualstore::storage::{InMemoryBackend, KeyValueBackend, MemoryKeyValueStore};
//! use dualstore::{MappingTable, MigratorConfig, StorageMigrator};
//!
//! let legacy = Arc::new(KeyValueBackend::new(MemoryKeyValueStore::new()));
//! let target = Arc::new(InMemoryBackend::new());
//! let migrator = StorageMigrator::new(
//!     legacy,
//!     target.clone(),
//!     target,
//!     MappingTable::standard(),
//!     MigratorConfig::default(),
//! )?;
//!
//! migrator.create_backup()?;
//! let report = migrator.migrate_from_local_storage()?;
//! assert!(report.passed());
//! migrator.complete_cutover()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod mode;
pub mod record;
pub mod report;
pub mod storage;

// Migration
pub mod backup;
pub mod config;
pub mod mapping;
pub mod migrator;

// Runtime surface
pub mod health;
pub mod timeline;
pub mod unified;

// Re-export primary types at crate root for convenience
pub use backup::{BackupId, BackupSnapshot, BackupSummary, BackupVault};
pub use config::{FacadeConfig, MigratorConfig, RetryPolicy};
pub use error::{EngineError, EngineResult, PreconditionError, TransformError};
pub use health::{HealthReport, HealthReporter};
pub use mapping::{EntityMappingRule, FieldNaming, ForeignKey, MappingTable, MappingTableBuilder};
pub use migrator::{CancelHandle, RollbackOutcome, StorageMigrator};
pub use mode::{MigrationMetadata, MigrationMode, MigrationStateMachine};
pub use record::{EntityRecord, EntityType, Fields, RecordId};
pub use report::{
    EntityCounts, FailureStage, IntegrityViolation, MigrationReport, MigrationTally, RecordFailure,
    ReportKind, ReportStatus,
};
pub use storage::{ErrorClass, StorageBackend, StorageError};
pub use timeline::{Timeline, TimelineAction, TimelineEntry};
pub use unified::UnifiedStore;
