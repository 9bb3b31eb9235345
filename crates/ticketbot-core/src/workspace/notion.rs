//! Notion REST client over `ureq`.

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{WorkspaceDb, WorkspaceError};
use crate::intake::TicketSubmission;

/// Connection settings for one Notion database.
#[derive(Debug, Clone)]
pub struct NotionSettings {
    pub pages_endpoint: String,
    /// Database endpoint; the database id and `/query` are appended.
    pub db_endpoint: String,
    pub token: String,
    pub database_id: String,
    pub api_version: String,
    pub page_size: u32,
}

pub struct NotionClient {
    settings: NotionSettings,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
struct QueryPage {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

impl NotionClient {
    #[must_use]
    pub fn new(settings: NotionSettings) -> Self {
        Self {
            settings,
            agent: ureq::AgentBuilder::new()
                .timeout(std::time::Duration::from_secs(30))
                .build(),
        }
    }

    #[must_use]
    pub fn query_url(&self) -> String {
        format!(
            "{}{}/query",
            self.settings.db_endpoint, self.settings.database_id
        )
    }

    fn post(&self, url: &str, body: &Value) -> Result<ureq::Response, ureq::Error> {
        self.agent
            .post(url)
            .set("Authorization", &format!("Bearer {}", self.settings.token))
            .set("Content-Type", "application/json")
            .set("Notion-Version", &self.settings.api_version)
            .send_json(body)
    }
}

/// Query body for one page of results.
#[must_use]
pub fn query_body(page_size: u32, start_cursor: Option<&str>) -> Value {
    let mut body = json!({ "page_size": page_size });
    if let Some(cursor) = start_cursor {
        body["start_cursor"] = json!(cursor);
    }
    body
}

fn rich_text(content: &str) -> Value {
    json!({ "rich_text": [{ "type": "text", "text": { "content": content } }] })
}

/// Page-creation payload for a submitted ticket.
#[must_use]
pub fn page_payload(database_id: &str, ticket: &TicketSubmission) -> Value {
    let request_type: Vec<Value> = ticket
        .request_types
        .iter()
        .map(|name| json!({ "name": name }))
        .collect();

    json!({
        "parent": { "type": "database_id", "database_id": database_id },
        "properties": {
            "Title": {
                "title": [{ "type": "text", "text": { "content": ticket.title } }]
            },
            "Due Date": { "date": { "start": ticket.due_date } },
            "Requestor Name": rich_text(&ticket.requestor_name),
            "Requestor Email": rich_text(&ticket.requestor_email),
            "Request Details": rich_text(&ticket.details),
            "Request Type": { "multi_select": request_type },
            "Slack ID": rich_text(&ticket.chat_user_id),
            "URL": { "url": ticket.link },
        }
    })
}

fn http_error(err: ureq::Error) -> WorkspaceError {
    match err {
        ureq::Error::Status(status, response) => WorkspaceError::Http {
            status,
            body: response.into_string().unwrap_or_default(),
        },
        ureq::Error::Transport(transport) => WorkspaceError::Transport(transport.to_string()),
    }
}

impl WorkspaceDb for NotionClient {
    fn fetch_all(&self) -> Result<Vec<Value>, WorkspaceError> {
        let url = self.query_url();
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let body = query_body(self.settings.page_size, cursor.as_deref());
            let response = self.post(&url, &body).map_err(http_error)?;
            let page: QueryPage = response
                .into_json()
                .map_err(|err| WorkspaceError::Decode(err.to_string()))?;
            debug!(results = page.results.len(), has_more = page.has_more, "fetched result page");
            pages.extend(page.results);

            match (page.has_more, page.next_cursor) {
                (true, Some(next)) => cursor = Some(next),
                _ => break,
            }
        }

        info!(pages = pages.len(), "fetched workspace database");
        Ok(pages)
    }

    fn create(&self, ticket: &TicketSubmission) -> Result<u16, WorkspaceError> {
        let payload = page_payload(&self.settings.database_id, ticket);
        let status = match self.post(&self.settings.pages_endpoint, &payload) {
            Ok(response) => response.status(),
            Err(ureq::Error::Status(status, _)) => status,
            Err(err) => return Err(http_error(err)),
        };
        info!(status, "ticket payload sent");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> TicketSubmission {
        TicketSubmission {
            chat_user_id: "U42".into(),
            title: "Quarterly churn".into(),
            due_date: "2024-04-01".into(),
            requestor_name: "Sam Doe".into(),
            requestor_email: "sam@example.com".into(),
            details: "Need churn by region".into(),
            request_types: vec!["analysis".into(), "dashboard".into()],
            link: None,
        }
    }

    #[test]
    fn query_body_carries_cursor_only_when_paging() {
        assert_eq!(query_body(100, None), json!({ "page_size": 100 }));
        assert_eq!(
            query_body(50, Some("abc")),
            json!({ "page_size": 50, "start_cursor": "abc" })
        );
    }

    #[test]
    fn page_payload_maps_submission_fields() {
        let payload = page_payload("db-1", &submission());
        assert_eq!(payload["parent"]["database_id"], "db-1");
        let props = &payload["properties"];
        assert_eq!(props["Title"]["title"][0]["text"]["content"], "Quarterly churn");
        assert_eq!(props["Due Date"]["date"]["start"], "2024-04-01");
        assert_eq!(props["Slack ID"]["rich_text"][0]["text"]["content"], "U42");
        assert_eq!(props["Request Type"]["multi_select"][1]["name"], "dashboard");
        assert!(props["URL"]["url"].is_null());
    }

    #[test]
    fn query_url_joins_endpoint_and_database() {
        let client = NotionClient::new(NotionSettings {
            pages_endpoint: "https://api.notion.com/v1/pages".into(),
            db_endpoint: "https://api.notion.com/v1/databases/".into(),
            token: "t".into(),
            database_id: "abc123".into(),
            api_version: "2022-06-28".into(),
            page_size: 100,
        });
        assert_eq!(
            client.query_url(),
            "https://api.notion.com/v1/databases/abc123/query"
        );
    }
}
