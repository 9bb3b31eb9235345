//! Checkpoint cursors: how a tick finds the last committed snapshot.
//!
//! The legacy layout has no explicit pointer; the newest file under a prefix
//! is taken to be the previous state ([`LatestModified`]). [`PointerFile`]
//! names the last committed key in a small token object and moves it only
//! after a snapshot write succeeds, so a stray or half-finished upload under
//! the prefix never becomes "previous".
//!
//! ```text
//! _checkpoints/
//!   data_tickets.checkpoint     -> "data_tickets/20240305_0910.csv"
//!   notifications.checkpoint    -> "notifications/20240305_0910.csv"
//! ```

use tracing::{debug, error, warn};

use crate::record::Record;
use crate::store::{self, ObjectStore, StoreError};

/// Locates and advances the last committed snapshot for a prefix.
pub trait Checkpoint: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Key of the last committed snapshot under `prefix`.
    fn current(&self, store: &dyn ObjectStore, prefix: &str) -> Result<String, StoreError>;

    /// Record `key` as the last committed snapshot under `prefix`.
    fn advance(&self, store: &dyn ObjectStore, prefix: &str, key: &str) -> Result<(), StoreError>;
}

/// Previous state is the most recently modified file under the prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatestModified;

impl Checkpoint for LatestModified {
    fn name(&self) -> &'static str {
        "latest-modified"
    }

    fn current(&self, store: &dyn ObjectStore, prefix: &str) -> Result<String, StoreError> {
        store::most_recent_key(store, prefix)
    }

    fn advance(&self, _store: &dyn ObjectStore, _prefix: &str, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Previous state is named by a token object under `pointer_prefix`.
///
/// With no token yet (first run after switching from the legacy layout) the
/// newest file under the prefix is used.
#[derive(Debug, Clone)]
pub struct PointerFile {
    pointer_prefix: String,
}

impl PointerFile {
    #[must_use]
    pub fn new(pointer_prefix: impl Into<String>) -> Self {
        Self {
            pointer_prefix: pointer_prefix.into(),
        }
    }

    #[must_use]
    pub fn token_key(&self, prefix: &str) -> String {
        format!(
            "{}/{}.checkpoint",
            self.pointer_prefix.trim_end_matches('/'),
            prefix.trim_matches('/').replace('/', "_")
        )
    }
}

impl Checkpoint for PointerFile {
    fn name(&self) -> &'static str {
        "pointer-file"
    }

    fn current(&self, store: &dyn ObjectStore, prefix: &str) -> Result<String, StoreError> {
        let token = self.token_key(prefix);
        match store.get(&token) {
            Ok(body) => {
                let key = String::from_utf8_lossy(&body).trim().to_string();
                if key.is_empty() {
                    return Err(StoreError::NotFound(token));
                }
                Ok(key)
            }
            Err(StoreError::NotFound(_)) => {
                debug!(prefix, token = %token, "no checkpoint token, using newest file");
                store::most_recent_key(store, prefix)
            }
            Err(err) => Err(err),
        }
    }

    fn advance(&self, store: &dyn ObjectStore, prefix: &str, key: &str) -> Result<(), StoreError> {
        store.put(&self.token_key(prefix), key.as_bytes())
    }
}

/// What a tick knows about the previous state of a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Previous {
    Loaded { key: String, records: Vec<Record> },
    ColdStart { reason: String },
}

impl Previous {
    #[must_use]
    pub fn records(&self) -> Option<&[Record]> {
        match self {
            Self::Loaded { records, .. } => Some(records),
            Self::ColdStart { .. } => None,
        }
    }

    #[must_use]
    pub const fn is_cold_start(&self) -> bool {
        matches!(self, Self::ColdStart { .. })
    }
}

/// Load the last committed snapshot for `prefix`.
///
/// A missing checkpoint, file, or prefix is a cold start; the caller counts
/// it. A snapshot that exists but cannot be read or decoded is an error, since
/// treating it as absent would drop the history behind it.
pub fn load_previous(
    store: &dyn ObjectStore,
    checkpoint: &dyn Checkpoint,
    prefix: &str,
) -> Result<Previous, StoreError> {
    let loaded = checkpoint
        .current(store, prefix)
        .and_then(|key| store::read_csv(store, &key).map(|records| (key, records)));
    match loaded {
        Ok((key, records)) => {
            debug!(prefix, key = %key, rows = records.len(), cursor = checkpoint.name(), "loaded previous snapshot");
            Ok(Previous::Loaded { key, records })
        }
        Err(err) if err.is_missing() => {
            warn!(prefix, cursor = checkpoint.name(), code = %err.code(), error = %err, "previous snapshot missing, cold start");
            Ok(Previous::ColdStart {
                reason: err.to_string(),
            })
        }
        Err(err) => {
            error!(prefix, cursor = checkpoint.name(), code = %err.code(), error = %err, "previous snapshot unreadable");
            Err(err)
        }
    }
}
