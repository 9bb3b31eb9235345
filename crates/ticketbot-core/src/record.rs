//! Ticket records and notification log entries.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One flat CSV row. Key order is column order.
pub type Record = IndexMap<String, String>;

/// A ticket keyed by semantic field names (`title`, `status`, `ticket_id`, ...).
pub type TicketRecord = Record;

pub const UPLOADED_AT: &str = "uploaded_at";

/// Outcome of one notification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Success,
    Failed,
}

impl NotificationStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown notification status '{other}'")),
        }
    }
}

/// One row of the notification log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ticket_id: String,
    pub notification_status: NotificationStatus,
    /// `YYYY-MM-DD HH:MM:SS` in the configured timezone.
    pub notified_at: String,
}

impl LogEntry {
    pub const COLUMNS: [&'static str; 3] = ["notification_status", "notified_at", "ticket_id"];

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.notification_status == NotificationStatus::Success
    }

    /// Flatten into a CSV row using the on-disk column order.
    #[must_use]
    pub fn to_record(&self) -> Record {
        let mut row = Record::with_capacity(3);
        row.insert(
            "notification_status".to_string(),
            self.notification_status.as_str().to_string(),
        );
        row.insert("notified_at".to_string(), self.notified_at.clone());
        row.insert("ticket_id".to_string(), self.ticket_id.clone());
        row
    }

    /// Parse a CSV row. Returns a description of the problem when a column is
    /// missing or the status is unknown.
    pub fn from_record(row: &Record) -> Result<Self, String> {
        let ticket_id = row
            .get("ticket_id")
            .ok_or_else(|| "missing ticket_id column".to_string())?;
        let status = row
            .get("notification_status")
            .ok_or_else(|| "missing notification_status column".to_string())?;
        Ok(Self {
            ticket_id: ticket_id.clone(),
            notification_status: status.parse()?,
            notified_at: row.get("notified_at").cloned().unwrap_or_default(),
        })
    }
}

/// Which column holds identity, which holds status, and which status values
/// count as completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRule {
    pub id_column: String,
    pub status_column: String,
    pub completed_labels: BTreeSet<String>,
}

impl CompletionRule {
    #[must_use]
    pub fn new<I, S>(id_column: &str, status_column: &str, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id_column: id_column.to_string(),
            status_column: status_column.to_string(),
            completed_labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn ticket_id<'a>(&self, record: &'a TicketRecord) -> Option<&'a str> {
        record.get(&self.id_column).map(String::as_str)
    }

    /// True when the record's status is one of the completed labels.
    #[must_use]
    pub fn is_completed(&self, record: &TicketRecord) -> bool {
        record
            .get(&self.status_column)
            .is_some_and(|status| self.completed_labels.contains(status))
    }
}
