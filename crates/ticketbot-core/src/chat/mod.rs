//! Chat platform boundary: message delivery and user lookup.

pub mod slack;

use crate::error::ErrorCode;

pub use slack::SlackClient;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat API rejected the call: {0}")]
    Api(String),

    #[error("chat API returned HTTP {0}")]
    Http(u16),

    #[error("chat API transport error: {0}")]
    Transport(String),

    #[error("failed to decode chat API response: {0}")]
    Decode(String),
}

impl ChatError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::Delivery
    }
}

/// Email and display name of a chat user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub email: String,
    pub display_name: String,
}

/// Operations the core needs from the chat platform.
pub trait ChatPlatform: Send + Sync {
    /// Deliver `text` to a user or channel id. Errors when delivery fails.
    fn send_message(&self, destination: &str, text: &str) -> Result<(), ChatError>;

    fn lookup_user_profile(&self, user_id: &str) -> Result<UserProfile, ChatError>;
}
