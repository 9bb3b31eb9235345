//! Object storage for snapshot files.
//!
//! Snapshots live under a prefix and are never edited in place:
//!
//! ```text
//! data_tickets/
//!   20240305_0900.csv
//!   20240305_0910.csv
//! notifications/
//!   20240305_0910.csv
//! ```
//!
//! # Invariants
//!
//! - `put` replaces a whole object; readers see the old body or the new one.
//! - The `{prefix}/` placeholder key is never treated as a snapshot.
//! - Listing order is by key; recency is decided by `last_modified`.

pub mod fs;
pub mod memory;

use std::io;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::ErrorCode;
use crate::record::Record;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;

/// Errors raised by object storage.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("no snapshot files under prefix '{0}'")]
    EmptyPrefix(String),

    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("storage I/O error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("CSV error in '{key}': {source}")]
    Csv {
        key: String,
        #[source]
        source: csv::Error,
    },
}

impl StoreError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) | Self::EmptyPrefix(_) => ErrorCode::SnapshotUnavailable,
            Self::InvalidKey(_) | Self::Io { .. } | Self::Csv { .. } => ErrorCode::StorageWrite,
        }
    }

    /// The object or prefix is absent, as opposed to present but unreadable.
    #[must_use]
    pub const fn is_missing(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::EmptyPrefix(_))
    }

    pub(crate) fn io(key: &str, source: io::Error) -> Self {
        Self::Io {
            key: key.to_string(),
            source,
        }
    }
}

/// Key and modification time of one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

/// Minimal object-storage surface used by the pipeline.
pub trait ObjectStore: Send + Sync {
    /// Every object whose key starts with `prefix`, sorted by key.
    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Create or wholly replace the object at `key`.
    fn put(&self, key: &str, body: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// The directory placeholder key for `prefix`.
#[must_use]
pub fn placeholder_key(prefix: &str) -> String {
    format!("{}/", prefix.trim_end_matches('/'))
}

/// Snapshot files under `prefix/`, placeholder excluded.
pub fn list_snapshots(store: &dyn ObjectStore, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
    let dir = placeholder_key(prefix);
    let mut files = store.list(&dir)?;
    files.retain(|obj| obj.key != dir);
    Ok(files)
}

/// Decode CSV bytes with a header row into records.
pub fn decode_csv(key: &str, body: &[u8]) -> Result<Vec<Record>, StoreError> {
    let csv_err = |source| StoreError::Csv {
        key: key.to_string(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body);
    let headers = reader.headers().map_err(csv_err)?.clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_err)?;
        let record = headers
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.to_string(), row.get(idx).unwrap_or_default().to_string()))
            .collect();
        records.push(record);
    }
    Ok(records)
}

/// Encode records as CSV. The header is the first record's key order; keys
/// missing from later records are written empty and extra keys are dropped.
pub fn encode_csv(key: &str, records: &[Record]) -> Result<Vec<u8>, StoreError> {
    let csv_err = |source| StoreError::Csv {
        key: key.to_string(),
        source,
    };
    let Some(first) = records.first() else {
        return Ok(Vec::new());
    };
    let header: Vec<&str> = first.keys().map(String::as_str).collect();

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&header).map_err(csv_err)?;
    for record in records {
        writer
            .write_record(
                header
                    .iter()
                    .map(|column| record.get(*column).map_or("", String::as_str)),
            )
            .map_err(csv_err)?;
    }
    writer
        .into_inner()
        .map_err(|err| StoreError::io(key, err.into_error()))
}

pub fn read_csv(store: &dyn ObjectStore, key: &str) -> Result<Vec<Record>, StoreError> {
    info!(key, "reading snapshot");
    let body = store.get(key)?;
    decode_csv(key, &body)
}

/// Write `records` to `key`. Returns `false` (and writes nothing) when there
/// are no records.
pub fn write_csv(store: &dyn ObjectStore, key: &str, records: &[Record]) -> Result<bool, StoreError> {
    if records.is_empty() {
        info!(key, "record set is empty, no file written");
        return Ok(false);
    }
    let body = encode_csv(key, records)?;
    info!(key, rows = records.len(), "writing snapshot");
    store.put(key, &body)?;
    Ok(true)
}

/// The most recently modified snapshot under `prefix`.
///
/// Ties on `last_modified` go to the greatest key, which is also the newest
/// file name.
pub fn most_recent_key(store: &dyn ObjectStore, prefix: &str) -> Result<String, StoreError> {
    list_snapshots(store, prefix)?
        .into_iter()
        .max_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.key.cmp(&b.key))
        })
        .map(|obj| obj.key)
        .ok_or_else(|| StoreError::EmptyPrefix(prefix.to_string()))
}

/// Records and key of the most recently modified snapshot under `prefix`.
pub fn most_recent_by_prefix(
    store: &dyn ObjectStore,
    prefix: &str,
) -> Result<(Vec<Record>, String), StoreError> {
    let key = most_recent_key(store, prefix)?;
    debug!(prefix, key = %key, "most recent snapshot");
    let records = read_csv(store, &key)?;
    Ok((records, key))
}
