//! Completion notifications: one message to the ticket owner, one to the team.
//!
//! Each candidate stands alone. A failed send becomes a `failed` log entry
//! and the loop moves on; nothing is retried within a tick.

use chrono::NaiveDateTime;
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::chat::{ChatError, ChatPlatform};
use crate::clock::{Clock, DATE_FORMAT, DATETIME_FORMAT, format_datetime};
use crate::config::FieldMap;
use crate::record::{LogEntry, NotificationStatus, TicketRecord};

/// Values a completion message is rendered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionNotice<'r> {
    pub ticket_id: &'r str,
    pub chat_user_id: &'r str,
    pub title: &'r str,
    pub created_date: String,
    pub due_date: &'r str,
    pub page_url: &'r str,
}

impl<'r> CompletionNotice<'r> {
    /// Pick the message fields out of a ticket record. Missing columns render
    /// as empty text.
    #[must_use]
    pub fn from_record(record: &'r TicketRecord, fields: &FieldMap) -> Self {
        let get = |column: &str| record.get(column).map_or("", String::as_str);
        let created_at = get(fields.created_at());
        Self {
            ticket_id: get(fields.ticket_id()),
            chat_user_id: get(fields.chat_user_id()),
            title: get(fields.title()),
            created_date: created_date(created_at),
            due_date: get(fields.due_date()),
            page_url: get(fields.page_url()),
        }
    }

    fn body(&self) -> String {
        format!(
            "*Ticket*: {} \n*Created on*: {} \n*Due Date*: {} \n<{}|:point_right: Review here.>",
            self.title, self.created_date, self.due_date, self.page_url
        )
    }

    /// Message sent directly to the ticket owner.
    #[must_use]
    pub fn user_message(&self) -> String {
        format!("*Your Data Ticket is complete!*  :rocket: \n{}", self.body())
    }

    /// Message posted to the team channel.
    #[must_use]
    pub fn team_message(&self) -> String {
        format!(
            "*<@{}>'s Ticket is complete!* :rocket: \n{}",
            self.chat_user_id,
            self.body()
        )
    }
}

/// `YYYY-MM-DD` part of a normalized `created_at`; the raw value when it does
/// not parse.
fn created_date(created_at: &str) -> String {
    NaiveDateTime::parse_from_str(created_at, DATETIME_FORMAT)
        .map_or_else(|_| created_at.to_string(), |at| at.format(DATE_FORMAT).to_string())
}

/// Sends completion notices and reports one log entry per candidate.
pub struct Notifier<'a> {
    chat: &'a dyn ChatPlatform,
    fields: &'a FieldMap,
    team_channel: &'a str,
    clock: &'a dyn Clock,
    tz: Tz,
}

impl<'a> Notifier<'a> {
    #[must_use]
    pub fn new(
        chat: &'a dyn ChatPlatform,
        fields: &'a FieldMap,
        team_channel: &'a str,
        clock: &'a dyn Clock,
        tz: Tz,
    ) -> Self {
        Self {
            chat,
            fields,
            team_channel,
            clock,
            tz,
        }
    }

    /// Notify every candidate in order. Never fails; delivery problems are
    /// recorded as `failed` entries.
    #[must_use]
    pub fn notify(&self, candidates: &[TicketRecord]) -> Vec<LogEntry> {
        candidates
            .iter()
            .map(|record| {
                let notice = CompletionNotice::from_record(record, self.fields);
                let status = match self.deliver(&notice) {
                    Ok(()) => {
                        info!(ticket = notice.ticket_id, "completion notice sent");
                        NotificationStatus::Success
                    }
                    Err(err) => {
                        warn!(ticket = notice.ticket_id, code = %err.code(), error = %err, "completion notice failed");
                        NotificationStatus::Failed
                    }
                };
                LogEntry {
                    ticket_id: notice.ticket_id.to_string(),
                    notification_status: status,
                    notified_at: format_datetime(self.clock.now(), self.tz),
                }
            })
            .collect()
    }

    fn deliver(&self, notice: &CompletionNotice<'_>) -> Result<(), ChatError> {
        if notice.chat_user_id.is_empty() {
            return Err(ChatError::Api("ticket has no chat user id".to_string()));
        }
        self.chat.send_message(notice.chat_user_id, &notice.user_message())?;
        self.chat.send_message(self.team_channel, &notice.team_message())
    }
}
