//! Workspace database boundary: where tickets live.

pub mod notion;

use crate::error::ErrorCode;
use crate::intake::TicketSubmission;

pub use notion::NotionClient;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("workspace API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("workspace API transport error: {0}")]
    Transport(String),

    #[error("failed to decode workspace API response: {0}")]
    Decode(String),
}

impl WorkspaceError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::UpstreamFetch
    }
}

/// Operations the core needs from the workspace database.
pub trait WorkspaceDb: Send + Sync {
    /// Every ticket page, raw and nested, across all result pages.
    fn fetch_all(&self) -> Result<Vec<serde_json::Value>, WorkspaceError>;

    /// Create a ticket page. Returns the HTTP status the API answered with;
    /// anything but 200 means the ticket was not written.
    fn create(&self, ticket: &TicketSubmission) -> Result<u16, WorkspaceError>;
}
