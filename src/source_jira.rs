//! Jira tickets over the REST v2 API.
//!
//! The numeric ticket `id` is the monotonic identifier; the `KEY-123` key is
//! the human-facing reference. Listing uses JQL search ordered by id, so a
//! warm pass asks for `id > N` only.
//!
//! Authentication is basic auth with an account email and API token (Jira
//! Cloud), or a bearer personal access token when no email is configured
//! (Jira Data Center).

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing::debug;

use crate::config::{read_secret, JiraConfig};
use crate::error::{Result, RetrievalError};
use crate::http::{self, parse_timestamp, RetryPolicy};
use crate::models::{Repository, SourceComment, SourceIssue};
use crate::sources::ItemSource;

const FAIL: fn(String) -> RetrievalError = RetrievalError::ItemSource;
const PAGE_SIZE: u64 = 100;
const FIELDS: &str = "summary,description,reporter,created";

pub struct JiraTickets {
    client: Client,
    base_url: String,
    project_key: Option<String>,
    extra_jql: Option<String>,
    email: Option<String>,
    token: String,
    policy: RetryPolicy,
}

impl JiraTickets {
    pub fn new(config: &JiraConfig) -> Result<Self> {
        let token = read_secret(&config.token_env).ok_or_else(|| {
            RetrievalError::Configuration(format!(
                "Jira API token not set: export {}",
                config.token_env
            ))
        })?;

        Ok(Self {
            client: http::client(30)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            project_key: config.project_key.clone(),
            extra_jql: config.jql.clone(),
            email: read_secret(&config.email_env),
            token,
            policy: RetryPolicy::new(3, 500),
        })
    }

    fn get(&self, url: &str, query: &[(&str, String)]) -> RequestBuilder {
        let builder = self
            .client
            .get(url)
            .query(query)
            .header("Accept", "application/json");
        match &self.email {
            Some(email) => builder.basic_auth(email, Some(&self.token)),
            None => builder.bearer_auth(&self.token),
        }
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Option<Value>> {
        let response =
            http::send_with_retry(&self.policy, "jira", || self.get(url, query), FAIL).await?;
        http::json_or_none(response, "jira", FAIL).await
    }

    /// Project key for a repository: the configured key, else the name part.
    fn project_for<'a>(&'a self, repository: &'a Repository) -> &'a str {
        self.project_key.as_deref().unwrap_or(&repository.name)
    }

    fn parse_ticket(&self, json: &Value) -> Option<SourceIssue> {
        parse_ticket(&self.base_url, json)
    }
}

/// JQL for tickets above `since`, ascending by id.
pub fn build_jql(project_key: &str, since: Option<u64>, extra: Option<&str>) -> String {
    let mut clauses = vec![format!("project = \"{}\"", project_key)];
    if let Some(since) = since {
        clauses.push(format!("id > {}", since));
    }
    if let Some(extra) = extra.map(str::trim).filter(|e| !e.is_empty()) {
        clauses.push(format!("({})", extra));
    }
    format!("{} ORDER BY id ASC", clauses.join(" AND "))
}

fn parse_ticket(base_url: &str, json: &Value) -> Option<SourceIssue> {
    let id: u64 = json.get("id")?.as_str()?.parse().ok()?;
    let key = json.get("key")?.as_str()?.to_string();
    let fields = json.get("fields")?;
    Some(SourceIssue {
        id,
        url: Some(format!("{}/browse/{}", base_url, key)),
        reference: key,
        title: fields
            .get("summary")
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string(),
        body: fields
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or_default()
            .to_string(),
        author: fields
            .pointer("/reporter/displayName")
            .and_then(|n| n.as_str())
            .map(String::from),
        created_at: parse_timestamp(fields.get("created")),
        is_pull_request: false,
    })
}

fn parse_comment(json: &Value) -> Option<SourceComment> {
    Some(SourceComment {
        id: json.get("id")?.as_str()?.parse().ok()?,
        body: json
            .get("body")
            .and_then(|b| b.as_str())
            .unwrap_or_default()
            .to_string(),
        author: json
            .pointer("/author/displayName")
            .and_then(|n| n.as_str())
            .map(String::from),
        created_at: parse_timestamp(json.get("created")),
    })
}

fn page_total(json: &Value) -> u64 {
    json.get("total").and_then(|t| t.as_u64()).unwrap_or(0)
}

#[async_trait]
impl ItemSource for JiraTickets {
    fn name(&self) -> &str {
        "jira"
    }

    async fn list_issues(
        &self,
        repository: &Repository,
        since: Option<u64>,
    ) -> Result<Vec<SourceIssue>> {
        let url = format!("{}/rest/api/2/search", self.base_url);
        let jql = build_jql(
            self.project_for(repository),
            since,
            self.extra_jql.as_deref(),
        );
        let mut tickets = Vec::new();
        let mut start_at = 0u64;

        loop {
            let query = [
                ("jql", jql.clone()),
                ("startAt", start_at.to_string()),
                ("maxResults", PAGE_SIZE.to_string()),
                ("fields", FIELDS.to_string()),
            ];
            let json = self
                .get_json(&url, &query)
                .await?
                .ok_or_else(|| FAIL("jira search endpoint not found".to_string()))?;
            let page = json
                .get("issues")
                .and_then(|i| i.as_array())
                .cloned()
                .unwrap_or_default();
            let count = page.len() as u64;
            tickets.extend(page.iter().filter_map(|t| self.parse_ticket(t)));

            start_at += count;
            if count == 0 || start_at >= page_total(&json) {
                break;
            }
        }

        tickets.sort_by_key(|ticket| ticket.id);
        debug!(repo = %repository, count = tickets.len(), ?since, "jira tickets listed");
        Ok(tickets)
    }

    async fn list_comments(
        &self,
        _repository: &Repository,
        issue_id: u64,
    ) -> Result<Vec<SourceComment>> {
        let url = format!("{}/rest/api/2/issue/{}/comment", self.base_url, issue_id);
        let mut comments = Vec::new();
        let mut start_at = 0u64;

        loop {
            let query = [
                ("startAt", start_at.to_string()),
                ("maxResults", PAGE_SIZE.to_string()),
            ];
            let Some(json) = self.get_json(&url, &query).await? else {
                break;
            };
            let page = json
                .get("comments")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();
            let count = page.len() as u64;
            comments.extend(page.iter().filter_map(parse_comment));

            start_at += count;
            if count == 0 || start_at >= page_total(&json) {
                break;
            }
        }

        Ok(comments)
    }

    async fn fetch_issue(
        &self,
        _repository: &Repository,
        reference: &str,
    ) -> Result<Option<SourceIssue>> {
        let url = format!("{}/rest/api/2/issue/{}", self.base_url, reference.trim());
        let query = [("fields", FIELDS.to_string())];
        Ok(self
            .get_json(&url, &query)
            .await?
            .as_ref()
            .and_then(|t| self.parse_ticket(t)))
    }
}
