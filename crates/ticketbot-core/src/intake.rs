//! Ticket intake: write a submitted request to the workspace database and
//! tell the submitter and the team how it went.
//!
//! Only a `200` from the database counts as written. Anything else is retried
//! under the configured [`RetryPolicy`]; once attempts run out the failure
//! messages go out instead of the success messages. Reply delivery is best
//! effort and never changes the outcome.

use std::time::Duration;

use tracing::{info, warn};

use crate::chat::ChatPlatform;
use crate::config::IntakeMessages;
use crate::retry::RetryPolicy;
use crate::workspace::{WorkspaceDb, WorkspaceError};

/// A request as collected from the submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeRequest {
    pub user_id: String,
    pub title: String,
    /// `YYYY-MM-DD`.
    pub due_date: String,
    pub details: String,
    pub request_types: Vec<String>,
    pub link: Option<String>,
}

/// A request enriched with the submitter's profile, ready to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketSubmission {
    pub chat_user_id: String,
    pub title: String,
    pub due_date: String,
    pub requestor_name: String,
    pub requestor_email: String,
    pub details: String,
    pub request_types: Vec<String>,
    pub link: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("workspace answered HTTP {0} to ticket creation")]
    Rejected(u16),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

/// Result of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    Created { attempts: u32 },
    Failed { attempts: u32, reason: String },
}

impl IntakeOutcome {
    #[must_use]
    pub const fn is_created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }
}

/// Handles submissions against one database and team channel.
pub struct Intake<'a> {
    db: &'a dyn WorkspaceDb,
    chat: &'a dyn ChatPlatform,
    policy: RetryPolicy,
    messages: &'a IntakeMessages,
    team_channel: &'a str,
}

impl<'a> Intake<'a> {
    #[must_use]
    pub fn new(
        db: &'a dyn WorkspaceDb,
        chat: &'a dyn ChatPlatform,
        policy: RetryPolicy,
        messages: &'a IntakeMessages,
        team_channel: &'a str,
    ) -> Self {
        Self {
            db,
            chat,
            policy,
            messages,
            team_channel,
        }
    }

    /// Attach the submitter's email and display name. A failed lookup does
    /// not block the submission; placeholders are written instead.
    #[must_use]
    pub fn enrich(&self, request: IntakeRequest) -> TicketSubmission {
        let (requestor_email, requestor_name) = match self.chat.lookup_user_profile(&request.user_id) {
            Ok(profile) => (profile.email, profile.display_name),
            Err(err) => {
                warn!(user = %request.user_id, code = %err.code(), error = %err, "profile lookup failed");
                (
                    "No email".to_string(),
                    format!("Slack user id {}", request.user_id),
                )
            }
        };
        TicketSubmission {
            chat_user_id: request.user_id,
            title: request.title,
            due_date: request.due_date,
            requestor_name,
            requestor_email,
            details: request.details,
            request_types: request.request_types,
            link: request.link,
        }
    }

    /// Write `request` and send the replies, sleeping with `sleep` between
    /// attempts.
    pub fn submit_with<S>(&self, request: IntakeRequest, sleep: S) -> IntakeOutcome
    where
        S: FnMut(Duration),
    {
        let ticket = self.enrich(request);
        let user = ticket.chat_user_id.clone();
        let mut attempts = 0;

        let written = self.policy.run(sleep, |attempt| {
            attempts = attempt;
            match self.db.create(&ticket)? {
                200 => Ok(()),
                status => Err(IntakeError::Rejected(status)),
            }
        });

        match written {
            Ok(()) => {
                info!(user = %user, attempts, title = %ticket.title, "ticket created");
                self.reply(&user, &format!("<@{user}> {}", self.messages.success_msg_user));
                self.reply(
                    self.team_channel,
                    &format!("{} <@{user}>", self.messages.success_msg_team),
                );
                IntakeOutcome::Created { attempts }
            }
            Err(err) => {
                warn!(user = %user, attempts, error = %err, "ticket creation failed");
                self.reply(&user, &self.messages.fail_msg_user);
                self.reply(
                    self.team_channel,
                    &format!("{} <@{user}>", self.messages.fail_msg_team),
                );
                IntakeOutcome::Failed {
                    attempts,
                    reason: err.to_string(),
                }
            }
        }
    }

    /// [`submit_with`](Self::submit_with) using `std::thread::sleep`.
    pub fn submit(&self, request: IntakeRequest) -> IntakeOutcome {
        self.submit_with(request, std::thread::sleep)
    }

    fn reply(&self, destination: &str, text: &str) {
        if let Err(err) = self.chat.send_message(destination, text) {
            warn!(destination, code = %err.code(), error = %err, "intake reply not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatError, UserProfile};
    use std::sync::Mutex;

    struct FakeDb {
        statuses: Mutex<Vec<Result<u16, WorkspaceError>>>,
        seen: Mutex<Vec<TicketSubmission>>,
    }

    impl FakeDb {
        fn answering(statuses: Vec<Result<u16, WorkspaceError>>) -> Self {
            Self {
                statuses: Mutex::new(statuses),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl WorkspaceDb for FakeDb {
        fn fetch_all(&self) -> Result<Vec<serde_json::Value>, WorkspaceError> {
            Ok(Vec::new())
        }

        fn create(&self, ticket: &TicketSubmission) -> Result<u16, WorkspaceError> {
            self.seen.lock().expect("lock").push(ticket.clone());
            self.statuses.lock().expect("lock").remove(0)
        }
    }

    #[derive(Default)]
    struct FakeChat {
        profile: Option<UserProfile>,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl ChatPlatform for FakeChat {
        fn send_message(&self, destination: &str, text: &str) -> Result<(), ChatError> {
            self.sent
                .lock()
                .expect("lock")
                .push((destination.to_string(), text.to_string()));
            Ok(())
        }

        fn lookup_user_profile(&self, _user_id: &str) -> Result<UserProfile, ChatError> {
            self.profile
                .clone()
                .ok_or_else(|| ChatError::Api("user_not_found".into()))
        }
    }

    fn messages() -> IntakeMessages {
        IntakeMessages {
            success_msg_user: "your ticket is in".into(),
            success_msg_team: "new ticket from".into(),
            fail_msg_user: "could not file your ticket".into(),
            fail_msg_team: "ticket failed for".into(),
        }
    }

    fn request() -> IntakeRequest {
        IntakeRequest {
            user_id: "U42".into(),
            title: "Quarterly churn".into(),
            due_date: "2024-04-01".into(),
            details: "by region".into(),
            request_types: vec!["analysis".into()],
            link: Some("https://example.com/doc".into()),
        }
    }

    #[test]
    fn retries_once_then_reports_success() {
        let db = FakeDb::answering(vec![Ok(500), Ok(200)]);
        let chat = FakeChat {
            profile: Some(UserProfile {
                email: "sam@example.com".into(),
                display_name: "Sam Doe".into(),
            }),
            ..FakeChat::default()
        };
        let msgs = messages();
        let intake = Intake::new(&db, &chat, RetryPolicy::fixed(2, Duration::from_secs(3)), &msgs, "C01");

        let mut slept = Vec::new();
        let outcome = intake.submit_with(request(), |d| slept.push(d));

        assert_eq!(outcome, IntakeOutcome::Created { attempts: 2 });
        assert_eq!(slept, [Duration::from_secs(3)]);
        let seen = db.seen.lock().expect("lock");
        assert_eq!(seen[0].requestor_name, "Sam Doe");
        assert_eq!(seen[0].requestor_email, "sam@example.com");
        let sent = chat.sent.lock().expect("lock");
        assert_eq!(
            *sent,
            [
                ("U42".to_string(), "<@U42> your ticket is in".to_string()),
                ("C01".to_string(), "new ticket from <@U42>".to_string()),
            ]
        );
    }

    #[test]
    fn gives_up_after_policy_and_sends_failure_messages() {
        let db = FakeDb::answering(vec![
            Ok(400),
            Err(WorkspaceError::Transport("reset".into())),
        ]);
        let chat = FakeChat::default();
        let msgs = messages();
        let intake = Intake::new(&db, &chat, RetryPolicy::fixed(2, Duration::ZERO), &msgs, "C01");

        let outcome = intake.submit_with(request(), |_| {});

        assert!(matches!(outcome, IntakeOutcome::Failed { attempts: 2, ref reason } if reason.contains("reset")));
        let seen = db.seen.lock().expect("lock");
        assert_eq!(seen[0].requestor_email, "No email");
        assert_eq!(seen[0].requestor_name, "Slack user id U42");
        let sent = chat.sent.lock().expect("lock");
        assert_eq!(sent[0].1, "could not file your ticket");
        assert_eq!(sent[1], ("C01".to_string(), "ticket failed for <@U42>".to_string()));
    }

    #[test]
    fn non_200_success_status_is_not_created() {
        let db = FakeDb::answering(vec![Ok(201)]);
        let chat = FakeChat::default();
        let msgs = messages();
        let intake = Intake::new(&db, &chat, RetryPolicy::once(), &msgs, "C01");
        assert!(!intake.submit_with(request(), |_| {}).is_created());
    }
}
