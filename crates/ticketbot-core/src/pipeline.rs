//! One notification tick, end to end.
//!
//! ```text
//! build ─► load meta ─► diff ─► load log ─► retry select ─► dedup
//!       ─► notify ─► commit log ─► persist meta ─► prune
//! ```
//!
//! # Invariants
//!
//! - The record set persisted as the new meta snapshot is the same pull the
//!   diff ran against, so a completion can never fall between two pulls.
//! - A failed pull aborts the tick before anything is written.
//! - A previous meta or log snapshot that exists but cannot be read aborts the
//!   tick before anything is sent or written. Only an absent one is a cold
//!   start; a log rebuilt from an unreadable one would lose its `success` rows.
//! - The log is committed before the meta snapshot. If the log write fails
//!   the meta snapshot is still written: a lost `failed` entry costs a retry,
//!   a re-diffed completion would cost a duplicate message.
//! - Storage write and delete failures are logged and counted; the next tick
//!   writes a fresh snapshot anyway.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::json;
use tracing::{error, info, warn};

use crate::chat::{ChatPlatform, SlackClient};
use crate::checkpoint::{Checkpoint, LatestModified, PointerFile, Previous, load_previous};
use crate::clock::{Clock, SystemClock, format_datetime, retention_threshold};
use crate::config::{CheckpointMode, ColdStartPolicy, Config, ConfigError, FieldMap, Secrets};
use crate::dedup;
use crate::diff::diff;
use crate::error::ErrorCode;
use crate::lock::{LockError, TickLease};
use crate::log_writer;
use crate::metrics::{Counter, PipelineCounters, StageTimings};
use crate::notify::Notifier;
use crate::record::{CompletionRule, LogEntry, NotificationStatus, TicketRecord};
use crate::snapshot::{self, MetaSnapshotBuilder};
use crate::store::{FsObjectStore, ObjectStore, StoreError};
use crate::workspace::notion::NotionSettings;
use crate::workspace::{NotionClient, WorkspaceDb, WorkspaceError};

/// Errors that end a tick early.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("workspace pull failed, tick aborted: {0}")]
    UpstreamFetch(#[from] WorkspaceError),

    #[error("previous snapshot under '{prefix}' unreadable, tick aborted: {source}")]
    PreviousUnavailable {
        prefix: String,
        #[source]
        source: StoreError,
    },

    #[error("tick skipped: {0}")]
    Lease(#[from] LockError),
}

impl PipelineError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::UpstreamFetch(_) => ErrorCode::UpstreamFetch,
            Self::PreviousUnavailable { .. } => ErrorCode::SnapshotUnavailable,
            Self::Lease(err) => err.code(),
        }
    }
}

/// The collaborators a tick talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ObjectStore>,
    pub workspace: Arc<dyn WorkspaceDb>,
    pub chat: Arc<dyn ChatPlatform>,
    pub checkpoint: Arc<dyn Checkpoint>,
    pub clock: Arc<dyn Clock>,
}

/// Lock file shared by every process pointed at the same bucket.
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub path: PathBuf,
    pub timeout: Duration,
}

/// Tick parameters taken from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub meta_prefix: String,
    pub log_prefix: String,
    pub tz: Tz,
    pub team_channel: String,
    pub cold_start: ColdStartPolicy,
    pub max_delivery_attempts: u32,
    pub retention_days: u32,
    pub lease: Option<LeaseSettings>,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub started_at: String,
    pub pulled: usize,
    pub meta_cold_start: bool,
    pub log_cold_start: bool,
    pub newly_completed: usize,
    pub retries: usize,
    pub candidates: usize,
    pub sent: usize,
    pub failed: usize,
    pub log_key: Option<String>,
    pub meta_key: Option<String>,
    pub pruned: usize,
    pub storage_errors: usize,
    pub timings: StageTimings,
}

impl TickReport {
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "started_at": self.started_at,
            "pulled": self.pulled,
            "meta_cold_start": self.meta_cold_start,
            "log_cold_start": self.log_cold_start,
            "newly_completed": self.newly_completed,
            "retries": self.retries,
            "candidates": self.candidates,
            "sent": self.sent,
            "failed": self.failed,
            "log_key": self.log_key,
            "meta_key": self.meta_key,
            "pruned": self.pruned,
            "storage_errors": self.storage_errors,
            "timings": self.timings.to_json(),
        })
    }
}

/// The completion-detection and notification pipeline.
pub struct Pipeline {
    collab: Collaborators,
    fields: FieldMap,
    rule: CompletionRule,
    settings: PipelineSettings,
    counters: Arc<PipelineCounters>,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        collab: Collaborators,
        fields: FieldMap,
        rule: CompletionRule,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            collab,
            fields,
            rule,
            settings,
            counters: Arc::new(PipelineCounters::new()),
        }
    }

    /// Wire the production clients: Notion, Slack, and a filesystem store
    /// rooted at `storage.root`.
    pub fn from_config(config: &Config, secrets: &Secrets) -> Result<Self, ConfigError> {
        let fields = config.field_map()?;
        let rule = config.completion_rule()?;
        let tz = config.timezone()?;

        let workspace = NotionClient::new(NotionSettings {
            pages_endpoint: config.workspace.pages_endpoint.clone(),
            db_endpoint: config.workspace.db_endpoint.clone(),
            token: secrets.workspace_token.clone(),
            database_id: secrets.database_id.clone(),
            api_version: config.workspace.api_version.clone(),
            page_size: config.workspace.page_size,
        });
        let checkpoint: Arc<dyn Checkpoint> = match config.storage.checkpoint {
            CheckpointMode::Latest => Arc::new(LatestModified),
            CheckpointMode::Pointer => Arc::new(PointerFile::new(config.storage.checkpoint_prefix.clone())),
        };
        let collab = Collaborators {
            store: Arc::new(FsObjectStore::new(config.storage.root.clone())),
            workspace: Arc::new(workspace),
            chat: Arc::new(SlackClient::new(config.chat.api_base.clone(), secrets.chat_token.clone())),
            checkpoint,
            clock: Arc::new(SystemClock),
        };
        let settings = PipelineSettings {
            meta_prefix: config.storage.metafile_prefix.trim_end_matches('/').to_string(),
            log_prefix: config.storage.notifications_log_prefix.trim_end_matches('/').to_string(),
            tz,
            team_channel: secrets.team_channel_id.clone(),
            cold_start: config.notify.cold_start,
            max_delivery_attempts: config.notify.max_delivery_attempts,
            retention_days: config.schedule.retention_days,
            lease: config.schedule.lease_file.clone().map(|path| LeaseSettings {
                path,
                timeout: config.schedule.lease_timeout(),
            }),
        };
        Ok(Self::new(collab, fields, rule, settings))
    }

    /// Process-lifetime counters, shared with the caller.
    #[must_use]
    pub fn counters(&self) -> Arc<PipelineCounters> {
        Arc::clone(&self.counters)
    }

    /// Run one tick.
    pub fn tick(&self) -> Result<TickReport, PipelineError> {
        let _lease = match &self.settings.lease {
            Some(lease) => Some(TickLease::acquire(&lease.path, lease.timeout).inspect_err(|err| {
                self.counters.incr(Counter::TicksSkippedLease);
                warn!(code = %err.code(), error = %err, "tick lease held elsewhere, skipping tick");
            })?),
            None => None,
        };

        self.counters.incr(Counter::Ticks);
        let now = self.collab.clock.now();
        let tz = self.settings.tz;
        let store = self.collab.store.as_ref();
        let checkpoint = self.collab.checkpoint.as_ref();
        let mut report = TickReport {
            started_at: format_datetime(now, tz),
            ..TickReport::default()
        };
        let mut timings = StageTimings::default();

        let builder = MetaSnapshotBuilder::new(&self.fields, tz);
        let current = match timings.timed("build", || builder.build(self.collab.workspace.as_ref())) {
            Ok(current) => current,
            Err(err) => {
                self.counters.incr(Counter::TicksAborted);
                error!(code = %err.code(), error = %err, "workspace pull failed, tick aborted");
                return Err(err.into());
            }
        };
        report.pulled = current.len();

        let previous_meta =
            timings.timed("load_meta", || load_previous(store, checkpoint, &self.settings.meta_prefix));
        let previous_meta = previous_meta.map_err(|err| self.unreadable(&self.settings.meta_prefix, err))?;
        report.meta_cold_start = previous_meta.is_cold_start();
        let mut candidates = timings.timed("diff", || self.completions(&current, &previous_meta));
        report.newly_completed = candidates.len();

        let previous_log =
            timings.timed("load_log", || load_previous(store, checkpoint, &self.settings.log_prefix));
        let previous_log = previous_log.map_err(|err| self.unreadable(&self.settings.log_prefix, err))?;
        report.log_cold_start = previous_log.is_cold_start();
        if report.log_cold_start {
            self.counters.incr(Counter::ColdStartLog);
        }
        let log: Option<Vec<LogEntry>> = previous_log.records().map(dedup::parse_log);

        let to_notify = timings.timed("dedup", || {
            if let Some(log) = &log {
                let retries = dedup::retry_candidates(
                    &current,
                    log,
                    &candidates,
                    &self.rule,
                    self.settings.max_delivery_attempts,
                );
                report.retries = retries.len();
                candidates.extend(retries);
            }
            dedup::filter(candidates, log.as_deref(), &self.rule)
        });
        self.counters.add(Counter::RetriesAdmitted, report.retries as u64);
        report.candidates = to_notify.len();

        let notifier = Notifier::new(
            self.collab.chat.as_ref(),
            &self.fields,
            &self.settings.team_channel,
            self.collab.clock.as_ref(),
            tz,
        );
        let entries = timings.timed("notify", || notifier.notify(&to_notify));
        report.sent = entries.iter().filter(|e| e.is_success()).count();
        report.failed = entries
            .iter()
            .filter(|e| e.notification_status == NotificationStatus::Failed)
            .count();
        self.counters.add(Counter::NotificationsSent, report.sent as u64);
        self.counters.add(Counter::NotificationsFailed, report.failed as u64);

        report.log_key = timings.timed("commit_log", || {
            let written = log_writer::commit(
                store,
                &self.settings.log_prefix,
                &entries,
                previous_log.records(),
                now,
                tz,
            );
            self.advance(&self.settings.log_prefix, written, &mut report.storage_errors)
        });

        report.meta_key = timings.timed("persist_meta", || {
            let written = snapshot::persist(store, &self.settings.meta_prefix, &current, now, tz);
            self.advance(&self.settings.meta_prefix, written, &mut report.storage_errors)
        });

        let threshold = retention_threshold(now, tz, self.settings.retention_days);
        timings.timed("prune", || {
            for prefix in [&self.settings.meta_prefix, &self.settings.log_prefix] {
                self.prune(prefix, threshold, &mut report);
            }
        });
        self.counters.add(Counter::FilesPruned, report.pruned as u64);
        self.counters
            .add(Counter::StorageWriteErrors, report.storage_errors as u64);

        report.timings = timings;
        info!(
            pulled = report.pulled,
            newly_completed = report.newly_completed,
            retries = report.retries,
            sent = report.sent,
            failed = report.failed,
            pruned = report.pruned,
            storage_errors = report.storage_errors,
            "tick complete"
        );
        Ok(report)
    }

    fn unreadable(&self, prefix: &str, source: StoreError) -> PipelineError {
        self.counters.incr(Counter::TicksAborted);
        error!(prefix, code = %source.code(), error = %source, "previous snapshot unreadable, tick aborted");
        PipelineError::PreviousUnavailable {
            prefix: prefix.to_string(),
            source,
        }
    }

    /// Completed tickets the diff offers, honoring the cold-start policy.
    fn completions(&self, current: &[TicketRecord], previous: &Previous) -> Vec<TicketRecord> {
        if let Some(previous) = previous.records() {
            return diff(current, Some(previous), &self.rule);
        }
        self.counters.incr(Counter::ColdStartMeta);
        match self.settings.cold_start {
            ColdStartPolicy::NotifyAll => {
                warn!(prefix = %self.settings.meta_prefix, "no previous meta snapshot, every completed ticket is a candidate");
                diff(current, None, &self.rule)
            }
            ColdStartPolicy::NotifyNone => {
                warn!(prefix = %self.settings.meta_prefix, "no previous meta snapshot, seeding without notifying");
                Vec::new()
            }
        }
    }

    /// Move the checkpoint to a freshly written key.
    fn advance(
        &self,
        prefix: &str,
        written: Result<Option<String>, StoreError>,
        storage_errors: &mut usize,
    ) -> Option<String> {
        let key = match written {
            Ok(key) => key?,
            Err(err) => {
                *storage_errors += 1;
                warn!(prefix, code = %err.code(), error = %err, "snapshot write failed");
                return None;
            }
        };
        if let Err(err) = self
            .collab
            .checkpoint
            .advance(self.collab.store.as_ref(), prefix, &key)
        {
            *storage_errors += 1;
            warn!(prefix, key = %key, code = %err.code(), error = %err, "checkpoint not advanced");
        }
        Some(key)
    }

    fn prune(&self, prefix: &str, threshold: DateTime<Utc>, report: &mut TickReport) {
        let store = self.collab.store.as_ref();
        let keep = self.collab.checkpoint.current(store, prefix).ok();
        match snapshot::prune(store, prefix, threshold, keep.as_deref()) {
            Ok(pruned) => {
                report.pruned += pruned.deleted.len();
                report.storage_errors += pruned.failed.len();
            }
            Err(err) => {
                report.storage_errors += 1;
                warn!(prefix, code = %err.code(), error = %err, "retention listing failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatError, UserProfile};
    use crate::clock::ManualClock;
    use crate::config::{FieldMapConfig, FieldSpec};
    use crate::intake::TicketSubmission;
    use crate::store::MemoryObjectStore;
    use chrono::TimeZone;
    use serde_json::Value;
    use std::sync::Mutex;

    struct StaticDb(Mutex<Result<Vec<Value>, String>>);

    impl WorkspaceDb for StaticDb {
        fn fetch_all(&self) -> Result<Vec<Value>, WorkspaceError> {
            self.0.lock().expect("lock").clone().map_err(WorkspaceError::Transport)
        }

        fn create(&self, _ticket: &TicketSubmission) -> Result<u16, WorkspaceError> {
            Ok(200)
        }
    }

    #[derive(Default)]
    struct CountingChat(Mutex<usize>);

    impl ChatPlatform for CountingChat {
        fn send_message(&self, _destination: &str, _text: &str) -> Result<(), ChatError> {
            *self.0.lock().expect("lock") += 1;
            Ok(())
        }

        fn lookup_user_profile(&self, _user_id: &str) -> Result<UserProfile, ChatError> {
            Err(ChatError::Api("unused".into()))
        }
    }

    fn spec(source: &str) -> FieldSpec {
        FieldSpec {
            source: source.into(),
            column: None,
        }
    }

    fn fields() -> FieldMap {
        FieldMap::from_config(&FieldMapConfig {
            ticket_id: spec("id"),
            status: spec("status"),
            title: spec("title"),
            created_at: spec("created"),
            due_date: spec("due"),
            page_url: spec("url"),
            chat_user_id: spec("user"),
            requestor_name: None,
            requestor_email: None,
            request_details: None,
            request_type: None,
            project_link: None,
            archive_status: None,
            extra: Vec::new(),
        })
        .expect("fields")
    }

    fn page(id: u32, status: &str) -> Value {
        serde_json::json!({
            "id": id, "status": status, "title": "t", "created": "n/a",
            "due": "n/a", "url": "https://example.com", "user": "U1"
        })
    }

    fn pipeline(db: StaticDb, chat: Arc<CountingChat>, lease: Option<LeaseSettings>) -> Pipeline {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 5, 14, 0, 0).single().expect("time"),
        ));
        let collab = Collaborators {
            store: Arc::new(MemoryObjectStore::with_clock(clock.clone())),
            workspace: Arc::new(db),
            chat,
            checkpoint: Arc::new(LatestModified),
            clock,
        };
        let settings = PipelineSettings {
            meta_prefix: "data_tickets".into(),
            log_prefix: "notifications".into(),
            tz: Tz::UTC,
            team_channel: "C1".into(),
            cold_start: ColdStartPolicy::NotifyAll,
            max_delivery_attempts: 3,
            retention_days: 1,
            lease,
        };
        Pipeline::new(
            collab,
            fields(),
            CompletionRule::new("ticket_id", "status", ["Done"]),
            settings,
        )
    }

    #[test]
    fn failed_pull_aborts_without_writes() {
        let chat = Arc::new(CountingChat::default());
        let p = pipeline(StaticDb(Mutex::new(Err("reset".into()))), chat.clone(), None);
        let err = p.tick().unwrap_err();
        assert_eq!(err.code(), ErrorCode::UpstreamFetch);
        assert_eq!(p.counters().get(Counter::TicksAborted), 1);
        assert_eq!(*chat.0.lock().expect("lock"), 0);
    }

    #[test]
    fn first_tick_notifies_and_records_both_snapshots() {
        let chat = Arc::new(CountingChat::default());
        let db = StaticDb(Mutex::new(Ok(vec![page(1, "Done"), page(2, "Open")])));
        let p = pipeline(db, chat.clone(), None);
        let report = p.tick().expect("tick");
        assert!(report.meta_cold_start);
        assert!(report.log_cold_start);
        assert_eq!(report.sent, 1);
        assert_eq!(report.log_key.as_deref(), Some("notifications/20240305_1400.csv"));
        assert_eq!(report.meta_key.as_deref(), Some("data_tickets/20240305_1400.csv"));
        assert_eq!(*chat.0.lock().expect("lock"), 2);
        assert_eq!(report.to_json()["sent"], 1);
    }

    #[test]
    fn held_lease_skips_the_tick() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tick.lock");
        let _held = TickLease::acquire(&path, Duration::from_millis(10)).expect("lease");

        let chat = Arc::new(CountingChat::default());
        let db = StaticDb(Mutex::new(Ok(vec![page(1, "Done")])));
        let p = pipeline(
            db,
            chat,
            Some(LeaseSettings {
                path,
                timeout: Duration::from_millis(30),
            }),
        );
        let err = p.tick().unwrap_err();
        assert_eq!(err.code(), ErrorCode::LeaseContention);
        assert_eq!(p.counters().get(Counter::TicksSkippedLease), 1);
        assert_eq!(p.counters().get(Counter::Ticks), 0);
    }
}
