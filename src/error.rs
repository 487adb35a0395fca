//! Error types for dualstore.
//!
//! All errors are strongly typed using thiserror. Record-level failures during
//! bulk work never surface here; they are accumulated into a
//! [`MigrationReport`](crate::report::MigrationReport). Only preconditions,
//! catastrophic backend failures, and configuration problems are returned as
//! errors.

use thiserror::Error;

use crate::mode::MigrationMode;
use crate::record::EntityType;
use crate::storage::StorageError;

/// Preconditions checked before any mutation happens.
#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("A backup must be created before migrating")]
    BackupRequired,

    #[error("Invalid mode transition: {from} -> {to}")]
    InvalidTransition {
        from: MigrationMode,
        to: MigrationMode,
    },

    #[error("No backup available to roll back from")]
    NoBackupAvailable,

    #[error("Integrity check failed with {violations} violation(s); cutover refused")]
    IntegrityCheckFailed {
        violations: usize,
    },

    #[error("A migration run is already in progress")]
    MigrationInProgress,
}

/// Errors produced while transforming a legacy record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("Field '{field}' holds an unrecognized date: {value}")]
    InvalidDate {
        field: String,
        value: String,
    },

    #[error("Field '{field}' must be a string or integer id, got {value}")]
    InvalidIdentifier {
        field: String,
        value: String,
    },

    #[error("Dependency cycle between entity types: {0}")]
    DependencyCycle(String),

    #[error("Foreign key '{field}' on '{entity_type}' references unregistered type '{references}'")]
    UnknownReference {
        entity_type: EntityType,
        field: String,
        references: EntityType,
    },
}

/// Top-level error type for dualstore.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Invalid configuration: {message}")]
    Config {
        message: String,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl EngineError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if this is a precondition failure.
    #[must_use]
    pub const fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }

    /// Returns true if this error is retryable unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::Precondition(_) | Self::Transform(_) | Self::Config { .. } | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
