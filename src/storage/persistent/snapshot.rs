//! Compacted snapshot of every collection.
//!
//! The snapshot file holds the full store as of the last compaction. It is
//! written to a temporary file, fsynced, then renamed over the previous one,
//! so a crash leaves either the old or the new snapshot intact.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{EntityType, Fields, RecordId};

use super::codec;

/// In-memory layout shared with the backend.
pub type Collections = BTreeMap<EntityType, BTreeMap<RecordId, Fields>>;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotData {
    created_at: DateTime<Utc>,
    record_count: usize,
    collections: Collections,
}

/// Loads the snapshot, or an empty store if none exists yet.
pub fn load(path: &Path) -> IoResult<Collections> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Collections::new()),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    codec::read_header(&mut reader)?;
    let data: SnapshotData = codec::decode(&mut reader)?;
    Ok(data.collections)
}

/// Atomically replaces the snapshot. Returns the number of records written.
pub fn write(path: &Path, collections: &Collections) -> IoResult<usize> {
    let record_count = collections.values().map(BTreeMap::len).sum();
    let data = SnapshotData {
        created_at: Utc::now(),
        record_count,
        collections: collections.clone(),
    };

    let tmp = path.with_extension("tmp");
    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer)?;
        writer.write_all(&codec::encode(&data)?)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent() {
        // Persist the rename itself; not supported on every platform.
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    Ok(record_count)
}
