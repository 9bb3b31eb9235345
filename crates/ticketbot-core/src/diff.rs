//! Completion diff: which tickets became completed since the last snapshot.

use std::collections::HashSet;

use crate::record::{CompletionRule, TicketRecord};

/// Records of `current` that are completed now but were not completed in
/// `previous`, in `current` order.
///
/// With no previous snapshot every completed record is returned.
#[must_use]
pub fn diff(
    current: &[TicketRecord],
    previous: Option<&[TicketRecord]>,
    rule: &CompletionRule,
) -> Vec<TicketRecord> {
    let completed_now = current.iter().filter(|record| rule.is_completed(record));

    let Some(previous) = previous else {
        return completed_now.cloned().collect();
    };

    let completed_before: HashSet<&str> = previous
        .iter()
        .filter(|record| rule.is_completed(record))
        .filter_map(|record| rule.ticket_id(record))
        .collect();

    completed_now
        .filter(|record| {
            rule.ticket_id(record)
                .is_none_or(|id| !completed_before.contains(id))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> CompletionRule {
        CompletionRule::new("ticket_id", "status", ["Done"])
    }

    fn ticket(id: &str, status: &str) -> TicketRecord {
        let mut record = TicketRecord::new();
        record.insert("ticket_id".into(), id.into());
        record.insert("status".into(), status.into());
        record
    }

    fn ids(records: &[TicketRecord]) -> Vec<&str> {
        records.iter().map(|r| r["ticket_id"].as_str()).collect()
    }

    #[test]
    fn cold_start_returns_every_completed_ticket() {
        let current = [ticket("1", "Done"), ticket("2", "Open")];
        assert_eq!(ids(&diff(&current, None, &rule())), ["1"]);
    }

    #[test]
    fn transition_to_completed_is_reported_once() {
        let current = [ticket("1", "Done")];
        assert_eq!(ids(&diff(&current, Some(&[ticket("1", "Open")][..]), &rule())), ["1"]);
        assert!(diff(&current, Some(&[ticket("1", "Done")][..]), &rule()).is_empty());
    }

    #[test]
    fn output_keeps_current_order() {
        let current = [
            ticket("9", "Done"),
            ticket("3", "Done"),
            ticket("5", "Open"),
            ticket("4", "Done"),
        ];
        let previous = [ticket("3", "Done"), ticket("9", "In progress")];
        assert_eq!(ids(&diff(&current, Some(&previous[..]), &rule())), ["9", "4"]);
    }

    #[test]
    fn reopened_then_completed_again_is_new() {
        let previous = [ticket("1", "Open")];
        let current = [ticket("1", "Done")];
        assert_eq!(ids(&diff(&current, Some(&previous[..]), &rule())), ["1"]);
    }
}
