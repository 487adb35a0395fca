//! Storage backends for dualstore.
//!
//! The [`StorageBackend`] trait is the only thing the engine knows about a
//! store. Concrete implementations live in separate modules.

#[cfg(any(test, feature = "testing"))]
mod faulty;
mod kv;
mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

#[cfg(any(test, feature = "testing"))]
pub use faulty::FaultyBackend;
pub use kv::{KeyValueBackend, KeyValueStore, MemoryKeyValueStore, DEFAULT_PREFIX};
pub use memory::InMemoryBackend;
pub use traits::{BulkOutcome, ErrorClass, StorageBackend, StorageError};

#[cfg(feature = "persistent")]
pub use persistent::{open_backend, PersistentBackend, PersistentConfig};
