//! YAML configuration, validated once at startup.
//!
//! Secrets never appear in the file itself: `*_env` keys name the environment
//! variables holding them and [`Config::resolve_secrets`] reads them.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::record::CompletionRule;
use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("environment variable {0} is not set")]
    MissingEnv(String),
}

impl ConfigError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::ConfigInvalid
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    pub chat: ChatConfig,
    pub workspace: WorkspaceConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `ticketbot=debug,info`.
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Exclusive lock file held for the length of a tick.
    #[serde(default)]
    pub lease_file: Option<PathBuf>,
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            retention_days: default_retention_days(),
            lease_file: None,
            lease_timeout_secs: default_lease_timeout_secs(),
        }
    }
}

impl ScheduleConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.saturating_mul(60))
    }

    #[must_use]
    pub const fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_api_base")]
    pub api_base: String,
    pub bot_token_env: String,
    pub team_channel_id_env: String,
    pub messages: IntakeMessages,
}

/// Replies sent after a submission is (or fails to be) written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeMessages {
    pub success_msg_user: String,
    pub success_msg_team: String,
    pub fail_msg_user: String,
    pub fail_msg_team: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_pages_endpoint")]
    pub pages_endpoint: String,
    #[serde(default = "default_db_endpoint")]
    pub db_endpoint: String,
    pub token_env: String,
    pub database_id_env: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub completed_labels: Vec<String>,
    pub fields: FieldMapConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_attempts, Duration::from_millis(self.delay_ms))
    }
}

/// One mapped field: the flattened machine key and the snapshot column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub source: String,
    /// Defaults to the role name.
    #[serde(default)]
    pub column: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapConfig {
    pub ticket_id: FieldSpec,
    pub status: FieldSpec,
    pub title: FieldSpec,
    pub created_at: FieldSpec,
    pub due_date: FieldSpec,
    pub page_url: FieldSpec,
    pub chat_user_id: FieldSpec,
    #[serde(default)]
    pub requestor_name: Option<FieldSpec>,
    #[serde(default)]
    pub requestor_email: Option<FieldSpec>,
    #[serde(default)]
    pub request_details: Option<FieldSpec>,
    #[serde(default)]
    pub request_type: Option<FieldSpec>,
    #[serde(default)]
    pub project_link: Option<FieldSpec>,
    #[serde(default)]
    pub archive_status: Option<FieldSpec>,
    /// Further fields kept in the snapshot; `column` is required here.
    #[serde(default)]
    pub extra: Vec<FieldSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub root: PathBuf,
    #[serde(default = "default_meta_prefix")]
    pub metafile_prefix: String,
    #[serde(default = "default_log_prefix")]
    pub notifications_log_prefix: String,
    #[serde(default)]
    pub checkpoint: CheckpointMode,
    #[serde(default = "default_checkpoint_prefix")]
    pub checkpoint_prefix: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointMode {
    /// Newest file under the prefix is the previous state.
    #[default]
    Latest,
    /// A token object names the last committed snapshot.
    Pointer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColdStartPolicy {
    /// With no previous meta snapshot, every completed ticket is a candidate.
    #[default]
    NotifyAll,
    /// With no previous meta snapshot, nothing is a candidate; the pull only
    /// seeds the first snapshot.
    NotifyNone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub cold_start: ColdStartPolicy,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            cold_start: ColdStartPolicy::default(),
            max_delivery_attempts: default_max_delivery_attempts(),
        }
    }
}

/// Secrets read from the environment.
#[derive(Clone, PartialEq, Eq)]
pub struct Secrets {
    pub chat_token: String,
    pub team_channel_id: String,
    pub workspace_token: String,
    pub database_id: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("chat_token", &"<redacted>")
            .field("team_channel_id", &self.team_channel_id)
            .field("workspace_token", &"<redacted>")
            .field("database_id", &self.database_id)
            .finish()
    }
}

/// Validated mapping from flattened machine keys to snapshot columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMap {
    lookup: IndexMap<String, String>,
    ticket_id: String,
    status: String,
    title: String,
    created_at: String,
    due_date: String,
    page_url: String,
    chat_user_id: String,
}

/// Lowercase and replace spaces with underscores, as applied to flattened keys.
#[must_use]
pub fn normalize_key(key: &str) -> String {
    key.replace(' ', "_").to_lowercase()
}

impl FieldMap {
    /// Validate `cfg`: no empty names, no source mapped twice, no column used
    /// twice.
    pub fn from_config(cfg: &FieldMapConfig) -> Result<Self, ConfigError> {
        let optional = [
            ("requestor_name", &cfg.requestor_name),
            ("requestor_email", &cfg.requestor_email),
            ("request_details", &cfg.request_details),
            ("request_type", &cfg.request_type),
            ("project_link", &cfg.project_link),
            ("archive_status", &cfg.archive_status),
        ];
        let mut entries: Vec<(&str, &FieldSpec)> = vec![
            ("title", &cfg.title),
            ("due_date", &cfg.due_date),
            ("chat_user_id", &cfg.chat_user_id),
            ("page_url", &cfg.page_url),
            ("ticket_id", &cfg.ticket_id),
            ("status", &cfg.status),
            ("created_at", &cfg.created_at),
        ];
        entries.extend(
            optional
                .into_iter()
                .filter_map(|(role, spec)| spec.as_ref().map(|spec| (role, spec))),
        );

        let mut lookup = IndexMap::new();
        let mut columns = HashSet::new();
        let mut roles = IndexMap::new();
        for (role, spec) in entries {
            let column = spec.column.clone().unwrap_or_else(|| role.to_string());
            insert_field(&mut lookup, &mut columns, role, &spec.source, &column)?;
            roles.insert(role, column);
        }
        for spec in &cfg.extra {
            let column = spec.column.clone().ok_or_else(|| {
                ConfigError::Invalid(format!("extra field '{}' needs a column", spec.source))
            })?;
            insert_field(&mut lookup, &mut columns, "extra", &spec.source, &column)?;
        }

        let role = |name: &str| roles.get(name).cloned().unwrap_or_else(|| name.to_string());
        Ok(Self {
            ticket_id: role("ticket_id"),
            status: role("status"),
            title: role("title"),
            created_at: role("created_at"),
            due_date: role("due_date"),
            page_url: role("page_url"),
            chat_user_id: role("chat_user_id"),
            lookup,
        })
    }

    /// `(normalized source, column)` pairs in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lookup.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn ticket_id(&self) -> &str {
        &self.ticket_id
    }

    #[must_use]
    pub fn status(&self) -> &str {
        &self.status
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    #[must_use]
    pub fn due_date(&self) -> &str {
        &self.due_date
    }

    #[must_use]
    pub fn page_url(&self) -> &str {
        &self.page_url
    }

    #[must_use]
    pub fn chat_user_id(&self) -> &str {
        &self.chat_user_id
    }
}

fn insert_field(
    lookup: &mut IndexMap<String, String>,
    columns: &mut HashSet<String>,
    role: &str,
    source: &str,
    column: &str,
) -> Result<(), ConfigError> {
    let source = normalize_key(source.trim());
    let column = column.trim();
    if source.is_empty() || column.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "field '{role}' has an empty source or column"
        )));
    }
    if !columns.insert(column.to_string()) {
        return Err(ConfigError::Invalid(format!(
            "column '{column}' is mapped more than once"
        )));
    }
    if lookup.insert(source.clone(), column.to_string()).is_some() {
        return Err(ConfigError::Invalid(format!(
            "source key '{source}' is mapped more than once"
        )));
    }
    Ok(())
}

impl Config {
    /// Read and parse a YAML file, then validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on settings the tick cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.field_map()?;
        self.timezone()?;
        if self.workspace.completed_labels.iter().all(|l| l.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "workspace.completed_labels must name at least one status".into(),
            ));
        }
        if self.workspace.page_size == 0 || self.workspace.page_size > 100 {
            return Err(ConfigError::Invalid(
                "workspace.page_size must be between 1 and 100".into(),
            ));
        }
        if self.schedule.interval_minutes == 0 {
            return Err(ConfigError::Invalid(
                "schedule.interval_minutes must be positive".into(),
            ));
        }
        if self.workspace.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "workspace.retry.max_attempts must be positive".into(),
            ));
        }
        if self.notify.max_delivery_attempts == 0 {
            return Err(ConfigError::Invalid(
                "notify.max_delivery_attempts must be positive".into(),
            ));
        }

        let storage = &self.storage;
        let prefixes = [
            &storage.metafile_prefix,
            &storage.notifications_log_prefix,
            &storage.checkpoint_prefix,
        ];
        if prefixes.iter().any(|p| p.trim_matches('/').is_empty()) {
            return Err(ConfigError::Invalid("storage prefixes must not be empty".into()));
        }
        let distinct: HashSet<&str> = prefixes.iter().map(|p| p.trim_matches('/')).collect();
        if distinct.len() != prefixes.len() {
            return Err(ConfigError::Invalid("storage prefixes must be distinct".into()));
        }
        Ok(())
    }

    pub fn field_map(&self) -> Result<FieldMap, ConfigError> {
        FieldMap::from_config(&self.workspace.fields)
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.workspace.timezone.parse::<Tz>().map_err(|err| {
            ConfigError::Invalid(format!(
                "unknown timezone '{}': {err}",
                self.workspace.timezone
            ))
        })
    }

    /// The completion predicate over snapshot columns.
    pub fn completion_rule(&self) -> Result<CompletionRule, ConfigError> {
        let fields = self.field_map()?;
        let labels: BTreeSet<String> = self
            .workspace
            .completed_labels
            .iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        Ok(CompletionRule::new(fields.ticket_id(), fields.status(), labels))
    }

    /// Read every `*_env` reference through `lookup`.
    pub fn resolve_secrets(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Secrets, ConfigError> {
        let read = |name: &str| {
            lookup(name)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| ConfigError::MissingEnv(name.to_string()))
        };
        Ok(Secrets {
            chat_token: read(&self.chat.bot_token_env)?,
            team_channel_id: read(&self.chat.team_channel_id_env)?,
            workspace_token: read(&self.workspace.token_env)?,
            database_id: read(&self.workspace.database_id_env)?,
        })
    }
}

const fn default_interval_minutes() -> u64 {
    10
}

const fn default_retention_days() -> u32 {
    1
}

const fn default_lease_timeout_secs() -> u64 {
    5
}

fn default_chat_api_base() -> String {
    "https://slack.com/api".to_string()
}

fn default_pages_endpoint() -> String {
    "https://api.notion.com/v1/pages".to_string()
}

fn default_db_endpoint() -> String {
    "https://api.notion.com/v1/databases/".to_string()
}

fn default_api_version() -> String {
    "2022-06-28".to_string()
}

const fn default_page_size() -> u32 {
    100
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

const fn default_retry_attempts() -> u32 {
    2
}

const fn default_retry_delay_ms() -> u64 {
    3_000
}

fn default_meta_prefix() -> String {
    "data_tickets".to_string()
}

fn default_log_prefix() -> String {
    "notifications".to_string()
}

fn default_checkpoint_prefix() -> String {
    "_checkpoints".to_string()
}

const fn default_max_delivery_attempts() -> u32 {
    3
}
