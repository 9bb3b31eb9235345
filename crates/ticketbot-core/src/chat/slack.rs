//! Slack Web API client over `ureq`.
//!
//! Slack answers most failures with HTTP 200 and `"ok": false`; both that and
//! non-2xx statuses count as a failed call.

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::{ChatError, ChatPlatform, UserProfile};

pub struct SlackClient {
    api_base: String,
    token: String,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    user: Option<UserInfo>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    profile: ProfileInfo,
}

#[derive(Debug, Default, Deserialize)]
struct ProfileInfo {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    real_name: Option<String>,
}

impl SlackClient {
    #[must_use]
    pub fn new(api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            agent: ureq::AgentBuilder::new()
                .timeout(std::time::Duration::from_secs(15))
                .build(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{method}", self.api_base)
    }

    fn decode(response: Result<ureq::Response, ureq::Error>) -> Result<ApiReply, ChatError> {
        let response = response.map_err(|err| match err {
            ureq::Error::Status(status, _) => ChatError::Http(status),
            ureq::Error::Transport(transport) => ChatError::Transport(transport.to_string()),
        })?;
        let reply: Value = response
            .into_json()
            .map_err(|err| ChatError::Decode(err.to_string()))?;
        parse_reply(reply)
    }
}

/// `chat.postMessage` body: one mrkdwn section plus fallback text.
#[must_use]
pub fn post_message_body(channel: &str, text: &str) -> Value {
    json!({
        "channel": channel,
        "text": text,
        "blocks": [{ "type": "section", "text": { "type": "mrkdwn", "text": text } }],
    })
}

fn parse_reply(reply: Value) -> Result<ApiReply, ChatError> {
    let reply: ApiReply =
        serde_json::from_value(reply).map_err(|err| ChatError::Decode(err.to_string()))?;
    if reply.ok {
        Ok(reply)
    } else {
        Err(ChatError::Api(
            reply.error.unwrap_or_else(|| "unknown_error".to_string()),
        ))
    }
}

fn profile_from_reply(reply: ApiReply) -> Result<UserProfile, ChatError> {
    let profile = reply
        .user
        .map(|user| user.profile)
        .ok_or_else(|| ChatError::Decode("users.info reply has no user".to_string()))?;
    Ok(UserProfile {
        email: profile.email.unwrap_or_default(),
        display_name: profile.real_name.unwrap_or_default(),
    })
}

impl ChatPlatform for SlackClient {
    fn send_message(&self, destination: &str, text: &str) -> Result<(), ChatError> {
        let response = self
            .agent
            .post(&self.method_url("chat.postMessage"))
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Content-Type", "application/json; charset=utf-8")
            .send_json(post_message_body(destination, text));
        Self::decode(response)?;
        info!(destination, "message sent");
        Ok(())
    }

    fn lookup_user_profile(&self, user_id: &str) -> Result<UserProfile, ChatError> {
        let response = self
            .agent
            .get(&self.method_url("users.info"))
            .set("Authorization", &format!("Bearer {}", self.token))
            .query("user", user_id)
            .call();
        profile_from_reply(Self::decode(response)?)
    }
}
