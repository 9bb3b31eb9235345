//! Notification log commits.
//!
//! Each commit writes the whole log again as a new snapshot: this tick's
//! entries first, then every row of the previous snapshot.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::clock::snapshot_key;
use crate::record::{LogEntry, Record};
use crate::store::{self, ObjectStore, StoreError};

/// Rows of the next log snapshot.
#[must_use]
pub fn merge(new_entries: &[LogEntry], previous: Option<&[Record]>) -> Vec<Record> {
    new_entries
        .iter()
        .map(LogEntry::to_record)
        .chain(previous.unwrap_or_default().iter().cloned())
        .collect()
}

/// Write the merged log under `prefix`. With no new entries nothing is
/// written and `None` is returned.
pub fn commit(
    store: &dyn ObjectStore,
    prefix: &str,
    new_entries: &[LogEntry],
    previous: Option<&[Record]>,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Option<String>, StoreError> {
    if new_entries.is_empty() {
        tracing::info!(prefix, "no new notification entries, log unchanged");
        return Ok(None);
    }
    let key = snapshot_key(prefix, now, tz);
    let rows = merge(new_entries, previous);
    Ok(store::write_csv(store, &key, &rows)?.then_some(key))
}
