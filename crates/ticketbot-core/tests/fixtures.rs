//! In-memory collaborators and a harness for driving whole ticks.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::sync::{Arc, Mutex};

use chrono::{Duration, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::{Value, json};
use ticketbot_core::chat::{ChatError, ChatPlatform, UserProfile};
use ticketbot_core::checkpoint::{Checkpoint, LatestModified};
use ticketbot_core::clock::ManualClock;
use ticketbot_core::config::{ColdStartPolicy, FieldMap, FieldMapConfig, FieldSpec};
use ticketbot_core::dedup::parse_log;
use ticketbot_core::intake::TicketSubmission;
use ticketbot_core::pipeline::{Collaborators, Pipeline, PipelineSettings};
use ticketbot_core::record::{CompletionRule, LogEntry};
use ticketbot_core::store::{self, MemoryObjectStore, ObjectStore, StoreError};
use ticketbot_core::workspace::{WorkspaceDb, WorkspaceError};

pub const META: &str = "data_tickets";
pub const LOG: &str = "notifications";
pub const TEAM: &str = "C-team";

/// Workspace database holding a settable list of pages.
#[derive(Default)]
pub struct FakeWorkspace {
    pages: Mutex<Vec<Value>>,
    down: Mutex<bool>,
}

impl FakeWorkspace {
    pub fn set(&self, tickets: &[(u32, &str)]) {
        *self.pages.lock().expect("lock") = tickets.iter().map(|(id, status)| page(*id, status)).collect();
    }

    pub fn set_down(&self, down: bool) {
        *self.down.lock().expect("lock") = down;
    }
}

impl WorkspaceDb for FakeWorkspace {
    fn fetch_all(&self) -> Result<Vec<Value>, WorkspaceError> {
        if *self.down.lock().expect("lock") {
            return Err(WorkspaceError::Http {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        Ok(self.pages.lock().expect("lock").clone())
    }

    fn create(&self, _ticket: &TicketSubmission) -> Result<u16, WorkspaceError> {
        Ok(200)
    }
}

/// Chat platform that records deliveries and refuses chosen destinations.
#[derive(Default)]
pub struct FakeChat {
    refused: Mutex<HashSet<String>>,
    sent: Mutex<Vec<(String, String)>>,
}

impl FakeChat {
    pub fn refuse(&self, destination: &str) {
        self.refused.lock().expect("lock").insert(destination.to_string());
    }

    pub fn accept_all(&self) {
        self.refused.lock().expect("lock").clear();
    }

    pub fn sent_to(&self, destination: &str) -> usize {
        self.sent
            .lock()
            .expect("lock")
            .iter()
            .filter(|(d, _)| d == destination)
            .count()
    }

    /// Team-channel completion messages naming `user`.
    pub fn team_announcements_for(&self, user: &str) -> usize {
        let mention = format!("<@{user}>");
        self.sent
            .lock()
            .expect("lock")
            .iter()
            .filter(|(d, text)| d == TEAM && text.contains(&mention))
            .count()
    }

    pub fn total_sent(&self) -> usize {
        self.sent.lock().expect("lock").len()
    }
}

impl ChatPlatform for FakeChat {
    fn send_message(&self, destination: &str, text: &str) -> Result<(), ChatError> {
        if self.refused.lock().expect("lock").contains(destination) {
            return Err(ChatError::Api("channel_not_found".into()));
        }
        self.sent
            .lock()
            .expect("lock")
            .push((destination.to_string(), text.to_string()));
        Ok(())
    }

    fn lookup_user_profile(&self, user_id: &str) -> Result<UserProfile, ChatError> {
        Ok(UserProfile {
            email: format!("{user_id}@example.com"),
            display_name: user_id.to_string(),
        })
    }
}

/// Wraps a cursor and fails the next lookup for chosen prefixes with an I/O
/// error, as a flaky bucket mount would.
pub struct FaultyCursor {
    inner: Arc<dyn Checkpoint>,
    armed: Mutex<HashSet<String>>,
}

impl FaultyCursor {
    pub fn new(inner: Arc<dyn Checkpoint>) -> Self {
        Self {
            inner,
            armed: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_next_read(&self, prefix: &str) {
        self.armed.lock().expect("lock").insert(prefix.to_string());
    }
}

impl Checkpoint for FaultyCursor {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn current(&self, store: &dyn ObjectStore, prefix: &str) -> Result<String, StoreError> {
        if self.armed.lock().expect("lock").remove(prefix) {
            return Err(StoreError::Io {
                key: format!("{prefix}/"),
                source: io::Error::other("connection reset by peer"),
            });
        }
        self.inner.current(store, prefix)
    }

    fn advance(&self, store: &dyn ObjectStore, prefix: &str, key: &str) -> Result<(), StoreError> {
        self.inner.advance(store, prefix, key)
    }
}

pub fn user_for(id: u32) -> String {
    format!("U{id}")
}

pub fn page(id: u32, status: &str) -> Value {
    json!({
        "id": id,
        "properties": {
            "Status": { "name": status },
            "Title": [{ "plain_text": format!("Ticket {id}") }],
            "Due Date": { "start": "2024-03-20" },
            "Slack ID": [{ "plain_text": user_for(id) }]
        },
        "created_time": "2024-03-01T08:00:00.000Z",
        "url": format!("https://www.notion.so/ticket-{id}")
    })
}

fn spec(source: &str) -> FieldSpec {
    FieldSpec {
        source: source.into(),
        column: None,
    }
}

pub fn field_map() -> FieldMap {
    FieldMap::from_config(&FieldMapConfig {
        ticket_id: spec("id"),
        status: spec("properties_Status_name"),
        title: spec("properties_Title_0_plain_text"),
        created_at: spec("created_time"),
        due_date: spec("properties_Due Date_start"),
        page_url: spec("url"),
        chat_user_id: spec("properties_Slack ID_0_plain_text"),
        requestor_name: None,
        requestor_email: None,
        request_details: None,
        request_type: None,
        project_link: None,
        archive_status: None,
        extra: Vec::new(),
    })
    .expect("field map")
}

pub fn rule() -> CompletionRule {
    CompletionRule::new("ticket_id", "status", ["Done"])
}

/// Everything a tick touches, with handles kept for assertions.
pub struct Harness {
    pub store: Arc<MemoryObjectStore>,
    pub clock: Arc<ManualClock>,
    pub workspace: Arc<FakeWorkspace>,
    pub chat: Arc<FakeChat>,
    pub cursor: Arc<FaultyCursor>,
    pub pipeline: Pipeline,
}

pub struct HarnessOptions {
    pub checkpoint: Arc<dyn Checkpoint>,
    pub cold_start: ColdStartPolicy,
    pub max_delivery_attempts: u32,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            checkpoint: Arc::new(LatestModified),
            cold_start: ColdStartPolicy::NotifyAll,
            max_delivery_attempts: 3,
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    pub fn with_options(options: HarnessOptions) -> Self {
        Self::sharing(
            Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).single().expect("time"),
            )),
            None,
            options,
        )
    }

    /// A harness over an existing store and clock, e.g. to swap the cursor
    /// between ticks.
    pub fn sharing(
        clock: Arc<ManualClock>,
        store: Option<Arc<MemoryObjectStore>>,
        options: HarnessOptions,
    ) -> Self {
        let store = store.unwrap_or_else(|| Arc::new(MemoryObjectStore::with_clock(clock.clone())));
        let workspace = Arc::new(FakeWorkspace::default());
        let chat = Arc::new(FakeChat::default());
        let cursor = Arc::new(FaultyCursor::new(options.checkpoint));
        let collab = Collaborators {
            store: store.clone(),
            workspace: workspace.clone(),
            chat: chat.clone(),
            checkpoint: cursor.clone(),
            clock: clock.clone(),
        };
        let settings = PipelineSettings {
            meta_prefix: META.into(),
            log_prefix: LOG.into(),
            tz: Tz::UTC,
            team_channel: TEAM.into(),
            cold_start: options.cold_start,
            max_delivery_attempts: options.max_delivery_attempts,
            retention_days: 1,
            lease: None,
        };
        Self {
            store,
            clock,
            workspace,
            chat,
            cursor,
            pipeline: Pipeline::new(collab, field_map(), rule(), settings),
        }
    }

    /// Move the clock ten minutes, the default tick interval.
    pub fn advance(&self) {
        self.clock.advance(Duration::minutes(10));
    }

    pub fn newest_log(&self) -> Vec<LogEntry> {
        store::most_recent_by_prefix(self.store.as_ref(), LOG)
            .map(|(rows, _)| parse_log(&rows))
            .unwrap_or_default()
    }

    /// Distinct `success` rows per ticket across every log snapshot in the
    /// store. A row carried forward into later snapshots counts once; a second
    /// delivery, even one whose earlier row was lost, counts again.
    pub fn distinct_successes(&self) -> BTreeMap<String, usize> {
        let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
        for key in self.store.keys() {
            if !key.starts_with(&format!("{LOG}/")) || key.ends_with('/') {
                continue;
            }
            let body = self.store.get(&key).expect("get");
            let rows = store::decode_csv(&key, &body).expect("decode");
            for entry in parse_log(&rows).into_iter().filter(LogEntry::is_success) {
                seen.insert((entry.ticket_id, entry.notified_at));
            }
        }
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for (ticket_id, _) in seen {
            *counts.entry(ticket_id).or_default() += 1;
        }
        counts
    }
}
