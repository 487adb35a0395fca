//! Crash recovery and lifecycle tests for the persistent backend.
//!
//! These tests verify that the on-disk store correctly handles:
//! - Partial writes (simulated crash mid-append)
//! - Replay after compaction
//! - Migration state surviving a restart

#![cfg(feature = "persistent")]

use std::fs;
use std::sync::Arc;

use dualstore::storage::persistent::{open_backend, PersistentConfig};
use dualstore::storage::{KeyValueBackend, MemoryKeyValueStore};
use dualstore::{
    EngineError, EntityRecord, EntityType, MappingTable, MigrationMode, MigratorConfig,
    StorageBackend, StorageError, StorageMigrator,
};
use serde_json::json;
use tempfile::tempdir;

fn quiet() -> Option<PersistentConfig> {
    Some(PersistentConfig {
        sync_on_write: false,
        ..PersistentConfig::default()
    })
}

/// A torn final append is dropped and the store stays writable.
#[test]
fn test_torn_wal_tail_recovery() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join("records.wal");

    {
        let store = open_backend(dir.path(), quiet()).unwrap();
        for i in 0..5 {
            store
                .create(&EntityType::Clients, EntityRecord::with_id(format!("c{i}")).field("name", i))
                .unwrap();
        }
    }

    {
        let file = fs::OpenOptions::new().write(true).open(&wal_path).unwrap();
        let size = file.metadata().unwrap().len();
        file.set_len(size - 7).unwrap();
    }

    let store = open_backend(dir.path(), quiet()).unwrap();
    assert_eq!(store.count(&EntityType::Clients).unwrap(), 4);
    assert!(store.get_by_id(&EntityType::Clients, &"c4".into()).is_err());

    store
        .create(&EntityType::Clients, EntityRecord::with_id("c4").field("name", 4))
        .unwrap();
    drop(store);

    let store = open_backend(dir.path(), quiet()).unwrap();
    assert_eq!(store.count(&EntityType::Clients).unwrap(), 5);
}

/// Garbage appended after valid frames is cut off on open.
#[test]
fn test_trailing_garbage_is_ignored() {
    let dir = tempdir().unwrap();
    {
        let store = open_backend(dir.path(), quiet()).unwrap();
        store
            .create(&EntityType::Cases, EntityRecord::with_id("k1").field("title", "Lease"))
            .unwrap();
    }
    {
        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("records.wal"))
            .unwrap();
        file.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]).unwrap();
    }

    let store = open_backend(dir.path(), quiet()).unwrap();
    let case = store.get_by_id(&EntityType::Cases, &"k1".into()).unwrap();
    assert_eq!(case.get("title"), Some(&json!("Lease")));
}

/// Updates and deletes logged after a compaction replay over the snapshot.
#[test]
fn test_replay_over_snapshot() {
    let dir = tempdir().unwrap();
    {
        let store = open_backend(dir.path(), quiet()).unwrap();
        store
            .create(&EntityType::Clients, EntityRecord::with_id("c1").field("name", "Acme"))
            .unwrap();
        store
            .create(&EntityType::Clients, EntityRecord::with_id("c2").field("name", "Beta"))
            .unwrap();
        store.compact().unwrap();

        let mut partial = serde_json::Map::new();
        partial.insert("name".to_string(), json!("Acme Corp"));
        store.update(&EntityType::Clients, &"c1".into(), partial).unwrap();
        store.delete(&EntityType::Clients, &"c2".into()).unwrap();
    }

    let store = open_backend(dir.path(), quiet()).unwrap();
    let all = store.get_all(&EntityType::Clients).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].get("name"), Some(&json!("Acme Corp")));
}

/// Small WAL limits trigger compaction during ordinary writes.
#[test]
fn test_automatic_compaction() {
    let dir = tempdir().unwrap();
    let config = PersistentConfig {
        max_wal_size: 4 * 1024,
        sync_on_write: false,
    };
    let store = open_backend(dir.path(), Some(config.clone())).unwrap();
    for i in 0..200 {
        store
            .create(
                &EntityType::Tasks,
                EntityRecord::with_id(format!("t{i}")).field("title", "x".repeat(40)),
            )
            .unwrap();
    }
    assert!(store.wal_size().unwrap() <= config.max_wal_size + 1024);
    assert!(dir.path().join("snapshot.dat").exists());
    drop(store);

    let store = open_backend(dir.path(), Some(config)).unwrap();
    assert_eq!(store.count(&EntityType::Tasks).unwrap(), 200);
}

#[test]
fn test_store_is_single_process() {
    let dir = tempdir().unwrap();
    let _first = open_backend(dir.path(), quiet()).unwrap();
    let err = open_backend(dir.path(), quiet()).unwrap_err();
    assert!(matches!(err, EngineError::Storage(StorageError::Busy(_))));
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = tempdir().unwrap();
    let config = PersistentConfig {
        max_wal_size: 1,
        sync_on_write: false,
    };
    let err = open_backend(dir.path(), Some(config)).unwrap_err();
    assert!(matches!(err, EngineError::Config { .. }));
}

/// Migrating onto a durable target keeps data and mode across a restart.
#[test]
fn test_migration_survives_restart() {
    let dir = tempdir().unwrap();
    let legacy = Arc::new(KeyValueBackend::new(MemoryKeyValueStore::new()));
    legacy
        .create(&EntityType::Clients, EntityRecord::with_id("c1").field("fullName", "Acme"))
        .unwrap();
    legacy
        .create(
            &EntityType::Cases,
            EntityRecord::with_id("k1").field("caseTitle", "Lease").field("clientId", "c1"),
        )
        .unwrap();

    {
        let target = Arc::new(open_backend(dir.path(), quiet()).unwrap());
        let m = StorageMigrator::new(
            legacy.clone(),
            target.clone(),
            target,
            MappingTable::standard(),
            MigratorConfig::default(),
        )
        .unwrap();
        m.create_backup().unwrap();
        let report = m.migrate_from_local_storage().unwrap();
        assert!(report.passed(), "{:?}", report.errors);
    }

    let target = Arc::new(open_backend(dir.path(), quiet()).unwrap());
    let m = StorageMigrator::new(
        legacy,
        target.clone(),
        target.clone(),
        MappingTable::standard(),
        MigratorConfig::default(),
    )
    .unwrap();
    assert_eq!(m.get_migration_mode(), MigrationMode::Transitioning);
    assert_eq!(m.list_backups().unwrap().len(), 1);

    let case = target.get_by_id(&EntityType::Cases, &"k1".into()).unwrap();
    assert_eq!(case.get("client_id"), Some(&json!("c1")));

    m.complete_cutover().unwrap();
    assert_eq!(m.get_migration_mode(), MigrationMode::Modern);
}
