//! Notification log checks: never notify a ticket twice, and give tickets
//! whose delivery failed another chance.
//!
//! # Invariants
//!
//! - A ticket with any `success` entry is never a candidate again.
//! - A ticket is re-admitted only while it is still completed and its
//!   `failed` entries number fewer than the configured attempt limit.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::record::{CompletionRule, LogEntry, NotificationStatus, Record, TicketRecord};

/// Parse log snapshot rows. Rows that do not parse are skipped with a warning.
#[must_use]
pub fn parse_log(rows: &[Record]) -> Vec<LogEntry> {
    rows.iter()
        .enumerate()
        .filter_map(|(idx, row)| match LogEntry::from_record(row) {
            Ok(entry) => Some(entry),
            Err(reason) => {
                warn!(row = idx + 1, reason = %reason, "skipping malformed log row");
                None
            }
        })
        .collect()
}

fn successful_ids(log: &[LogEntry]) -> HashSet<&str> {
    log.iter()
        .filter(|entry| entry.is_success())
        .map(|entry| entry.ticket_id.as_str())
        .collect()
}

/// Drop candidates that already have a `success` log entry, keeping order.
/// With no log, candidates pass through unchanged.
#[must_use]
pub fn filter(
    candidates: Vec<TicketRecord>,
    log: Option<&[LogEntry]>,
    rule: &CompletionRule,
) -> Vec<TicketRecord> {
    let Some(log) = log else {
        return candidates;
    };
    let notified = successful_ids(log);
    candidates
        .into_iter()
        .filter(|record| rule.ticket_id(record).is_none_or(|id| !notified.contains(id)))
        .collect()
}

/// Completed tickets in `current` whose earlier deliveries all failed, fewer
/// than `max_attempts` times, and that are not already in `candidates`.
/// Returned in `current` order.
#[must_use]
pub fn retry_candidates(
    current: &[TicketRecord],
    log: &[LogEntry],
    candidates: &[TicketRecord],
    rule: &CompletionRule,
    max_attempts: u32,
) -> Vec<TicketRecord> {
    let notified = successful_ids(log);
    let mut failures: HashMap<&str, u32> = HashMap::new();
    for entry in log {
        if entry.notification_status == NotificationStatus::Failed {
            *failures.entry(entry.ticket_id.as_str()).or_default() += 1;
        }
    }
    let queued: HashSet<&str> = candidates
        .iter()
        .filter_map(|record| rule.ticket_id(record))
        .collect();

    current
        .iter()
        .filter(|record| rule.is_completed(record))
        .filter(|record| {
            rule.ticket_id(record).is_some_and(|id| {
                let failed = failures.get(id).copied().unwrap_or(0);
                failed > 0 && failed < max_attempts && !notified.contains(id) && !queued.contains(id)
            })
        })
        .cloned()
        .collect()
}
