//! Durable structured backend (cargo feature `persistent`).
//!
//! A store directory holds:
//! - `LOCK`: exclusive advisory lock, one process at a time
//! - `records.wal`: CRC32-framed write-ahead log of mutations
//! - `snapshot.dat`: compacted copy of every collection
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │             PersistentBackend             │
//! │   in-memory collections (RwLock)          │
//! │        │ log first          ▲ replay      │
//! │        ▼                    │             │
//! │   WriteAheadLog ──compact──▶ snapshot     │
//! │              FileLock (flock)             │
//! └───────────────────────────────────────────┘
//! ```

mod backend;
mod codec;
mod file_lock;
mod snapshot;
mod wal;

pub use backend::{CompactionResult, PersistentBackend};
pub use file_lock::FileLock;
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use crate::error::{EngineError, EngineResult};

/// Configuration for a persistent store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// WAL size that triggers compaction (bytes).
    pub max_wal_size: u64,
    /// fsync after every write.
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 16 * 1024 * 1024,
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// Checks the config.
    ///
    /// # Errors
    /// `Config` if `max_wal_size` is below 4 KiB.
    pub fn validate(self) -> EngineResult<Self> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(EngineError::config(format!(
                "max_wal_size must be at least {} bytes (got {})",
                Self::MIN_WAL_SIZE,
                self.max_wal_size
            )));
        }
        Ok(self)
    }
}

/// Opens or creates a persistent store at `path`.
///
/// # Errors
/// - `Config` if the config is invalid
/// - `Storage(Busy)` if another process holds the store
/// - `Storage` if the directory cannot be created or the snapshot is corrupt
///
/// # Example
/// ```rust,ignore
/// use dualstore::storage::persistent::open_backend;
///
/// let target = Arc::new(open_backend("./data/target", None)?);
/// ```
pub fn open_backend(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> EngineResult<PersistentBackend> {
    let cfg = config.unwrap_or_default().validate()?;
    Ok(PersistentBackend::open(path.as_ref(), cfg)?)
}
