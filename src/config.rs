//! Configuration for the migrator and the unified store.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{EngineError, EngineResult};

/// Retry policy for transient per-record failures during a migration run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per record, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt (milliseconds).
    pub initial_backoff_ms: u64,
    /// Factor applied to the delay after each attempt.
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay (milliseconds).
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            backoff_multiplier: 2.0,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            backoff_multiplier: 1.0,
            max_backoff_ms: 0,
        }
    }

    /// Retries immediately, up to `max_attempts` attempts in total.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            backoff_multiplier: 1.0,
            max_backoff_ms: 0,
        }
    }

    /// Delay to wait after the failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Checks the policy for nonsense values.
    ///
    /// # Errors
    /// `EngineError::Config` describing the first offending field.
    pub fn validate(self) -> EngineResult<Self> {
        if self.max_attempts == 0 {
            return Err(EngineError::config("retry.max_attempts must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(EngineError::config(format!(
                "retry.backoff_multiplier must be a finite value >= 1.0 (got {})",
                self.backoff_multiplier
            )));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(EngineError::config(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(self)
    }
}

/// Configuration for [`StorageMigrator`](crate::migrator::StorageMigrator).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MigratorConfig {
    /// Retry policy for transient record failures.
    pub retry: RetryPolicy,
    /// Worker threads used inside one entity type. 1 means sequential.
    pub record_workers: usize,
    /// Records per `bulk_create` call.
    pub batch_size: usize,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            record_workers: 1,
            batch_size: 500,
        }
    }
}

impl MigratorConfig {
    const MAX_WORKERS: usize = 64;

    /// Parses a JSON config document and validates it.
    ///
    /// Missing keys take their defaults.
    ///
    /// # Errors
    /// `EngineError::Config` if the document is malformed or invalid.
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::config(format!("malformed migrator config: {e}")))?;
        cfg.validate()
    }

    /// Checks the config for nonsense values.
    ///
    /// # Errors
    /// `EngineError::Config` describing the first offending field.
    pub fn validate(self) -> EngineResult<Self> {
        if self.record_workers == 0 || self.record_workers > Self::MAX_WORKERS {
            return Err(EngineError::config(format!(
                "record_workers must be between 1 and {} (got {})",
                Self::MAX_WORKERS,
                self.record_workers
            )));
        }
        if self.batch_size == 0 {
            return Err(EngineError::config("batch_size must be at least 1"));
        }
        let retry = self.retry.validate()?;
        Ok(Self { retry, ..self })
    }
}

/// Configuration for [`UnifiedStore`](crate::unified::UnifiedStore).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FacadeConfig {
    /// Actor recorded on timeline entries when the caller gives none.
    pub actor: String,
    /// Mirror writes to the legacy store while transitioning.
    pub mirror_to_legacy: bool,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            actor: "system".to_string(),
            mirror_to_legacy: true,
        }
    }
}

impl FacadeConfig {
    /// Checks the config.
    ///
    /// # Errors
    /// `EngineError::Config` if the actor is blank.
    pub fn validate(self) -> EngineResult<Self> {
        if self.actor.trim().is_empty() {
            return Err(EngineError::config("actor must not be blank"));
        }
        Ok(self)
    }
}
