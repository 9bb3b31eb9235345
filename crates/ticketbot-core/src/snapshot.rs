//! Meta snapshots: the full ticket collection captured at one instant.
//!
//! Building turns nested workspace pages into flat rows keyed by snapshot
//! column; persisting writes them as `{prefix}/{YYYYMMDD_HHMM}.csv`; pruning
//! drops files past retention.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use tracing::{info, warn};

use crate::clock::{self, format_datetime, looks_like_date, utc_iso_to_local};
use crate::config::{FieldMap, normalize_key};
use crate::record::{Record, TicketRecord, UPLOADED_AT};
use crate::store::{self, ObjectStore, StoreError};
use crate::workspace::{WorkspaceDb, WorkspaceError};

/// Flatten nested JSON into `parent_child` keys; list items are keyed by
/// index. Empty containers and nulls become empty strings.
#[must_use]
pub fn flatten(value: &Value) -> Record {
    let mut out = Record::new();
    flatten_into(value, None, &mut out);
    out
}

fn flatten_into(value: &Value, key: Option<&str>, out: &mut Record) {
    let child_key = |child: &str| match key {
        Some(parent) => format!("{parent}_{child}"),
        None => child.to_string(),
    };
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (child, nested) in map {
                flatten_into(nested, Some(&child_key(child)), out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (idx, nested) in items.iter().enumerate() {
                flatten_into(nested, Some(&child_key(&idx.to_string())), out);
            }
        }
        scalar => {
            if let Some(key) = key {
                out.insert(key.to_string(), scalar_text(scalar));
            }
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => String::new(),
    }
}

/// Turns workspace pages into ticket records.
#[derive(Debug, Clone)]
pub struct MetaSnapshotBuilder<'a> {
    fields: &'a FieldMap,
    tz: Tz,
}

impl<'a> MetaSnapshotBuilder<'a> {
    #[must_use]
    pub const fn new(fields: &'a FieldMap, tz: Tz) -> Self {
        Self { fields, tz }
    }

    /// Pull every page and normalize it. A failed pull is returned as-is so
    /// the caller can abort before anything is written.
    pub fn build(&self, db: &dyn WorkspaceDb) -> Result<Vec<TicketRecord>, WorkspaceError> {
        let pages = db.fetch_all()?;
        let records: Vec<TicketRecord> = pages.iter().map(|page| self.normalize(page)).collect();
        info!(records = records.len(), "built meta snapshot");
        Ok(records)
    }

    /// One page → one record with every mapped column, in field-map order.
    /// Unmapped keys are dropped; mapped keys absent from the page are empty.
    #[must_use]
    pub fn normalize(&self, page: &Value) -> TicketRecord {
        let flat: Record = flatten(page)
            .into_iter()
            .map(|(key, value)| (normalize_key(&key), value))
            .collect();

        self.fields
            .iter()
            .map(|(source, column)| {
                let raw = flat.get(source).cloned().unwrap_or_default();
                (column.to_string(), self.normalize_value(raw))
            })
            .collect()
    }

    fn normalize_value(&self, value: String) -> String {
        if !looks_like_date(&value) {
            return value;
        }
        utc_iso_to_local(&value, self.tz).unwrap_or(value)
    }
}

/// Stamp `records` with `uploaded_at` and write them under `prefix`.
///
/// Returns the written key, or `None` when there was nothing to write.
pub fn persist(
    store: &dyn ObjectStore,
    prefix: &str,
    records: &[TicketRecord],
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Option<String>, StoreError> {
    let uploaded_at = format_datetime(now, tz);
    let stamped: Vec<TicketRecord> = records
        .iter()
        .map(|record| {
            let mut record = record.clone();
            record.insert(UPLOADED_AT.to_string(), uploaded_at.clone());
            record
        })
        .collect();
    let key = clock::snapshot_key(prefix, now, tz);
    Ok(store::write_csv(store, &key, &stamped)?.then_some(key))
}

/// Outcome of one pruning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Delete files under `prefix` last modified strictly before `older_than`.
///
/// The `{prefix}/` placeholder and `keep` (the key a checkpoint points at)
/// are never deleted. Each deletion stands alone: a failure is recorded and
/// the rest proceed, so rerunning later finishes the job.
pub fn prune(
    store: &dyn ObjectStore,
    prefix: &str,
    older_than: DateTime<Utc>,
    keep: Option<&str>,
) -> Result<PruneReport, StoreError> {
    let mut report = PruneReport::default();
    let expired = store::list_snapshots(store, prefix)?
        .into_iter()
        .filter(|obj| obj.last_modified < older_than)
        .filter(|obj| keep != Some(obj.key.as_str()));

    for obj in expired {
        match store.delete(&obj.key) {
            Ok(()) => {
                info!(key = %obj.key, "deleted expired snapshot");
                report.deleted.push(obj.key);
            }
            Err(err) => {
                warn!(key = %obj.key, code = %err.code(), error = %err, "failed to delete expired snapshot");
                report.failed.push((obj.key, err.to_string()));
            }
        }
    }
    Ok(report)
}
