//! GitLab issues over the REST v4 API.
//!
//! The project-scoped `iid` is the issue identifier. Merge requests live on a
//! separate endpoint, so the issues listing never contains them. System
//! notes (label changes, assignments) are not comments and are skipped.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing::debug;

use crate::config::{read_secret, GitLabConfig};
use crate::error::{Result, RetrievalError};
use crate::http::{self, parse_timestamp, RetryPolicy};
use crate::models::{Repository, SourceComment, SourceIssue};
use crate::source_github::parse_hash_reference;
use crate::sources::ItemSource;

const FAIL: fn(String) -> RetrievalError = RetrievalError::ItemSource;
const PER_PAGE: usize = 100;

pub struct GitLabIssues {
    client: Client,
    api_url: String,
    token: Option<String>,
    policy: RetryPolicy,
}

impl GitLabIssues {
    pub fn new(config: &GitLabConfig) -> Result<Self> {
        Ok(Self {
            client: http::client(30)?,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: read_secret(&config.token_env),
            policy: RetryPolicy::new(3, 500),
        })
    }

    fn get(&self, url: &str, query: &[(&str, String)]) -> RequestBuilder {
        let builder = self.client.get(url).query(query);
        match &self.token {
            Some(token) => builder.header("PRIVATE-TOKEN", token),
            None => builder,
        }
    }

    fn project_url(&self, repository: &Repository) -> String {
        format!(
            "{}/projects/{}",
            self.api_url,
            encode_project_path(&repository.full_name())
        )
    }

    async fn fetch_page(&self, url: &str, query: &[(&str, String)]) -> Result<Vec<Value>> {
        let response =
            http::send_with_retry(&self.policy, "gitlab", || self.get(url, query), FAIL).await?;
        let json = http::json_or_fail(response, "gitlab", FAIL).await?;
        json.as_array()
            .cloned()
            .ok_or_else(|| FAIL(format!("gitlab: expected a JSON array from {}", url)))
    }
}

/// `group/sub/project` as a single path segment.
fn encode_project_path(path: &str) -> String {
    path.replace('/', "%2F")
}

pub fn parse_issue(json: &Value) -> Option<SourceIssue> {
    let iid = json.get("iid")?.as_u64()?;
    Some(SourceIssue {
        id: iid,
        reference: format!("#{}", iid),
        url: json
            .get("web_url")
            .and_then(|u| u.as_str())
            .map(String::from),
        title: json
            .get("title")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string(),
        body: json
            .get("description")
            .and_then(|d| d.as_str())
            .unwrap_or_default()
            .to_string(),
        author: json
            .pointer("/author/username")
            .and_then(|u| u.as_str())
            .map(String::from),
        created_at: parse_timestamp(json.get("created_at")),
        is_pull_request: false,
    })
}

fn parse_note(json: &Value) -> Option<SourceComment> {
    if json.get("system").and_then(|s| s.as_bool()).unwrap_or(false) {
        return None;
    }
    Some(SourceComment {
        id: json.get("id")?.as_u64()?,
        body: json
            .get("body")
            .and_then(|b| b.as_str())
            .unwrap_or_default()
            .to_string(),
        author: json
            .pointer("/author/username")
            .and_then(|u| u.as_str())
            .map(String::from),
        created_at: parse_timestamp(json.get("created_at")),
    })
}

#[async_trait]
impl ItemSource for GitLabIssues {
    fn name(&self) -> &str {
        "gitlab"
    }

    async fn list_issues(
        &self,
        repository: &Repository,
        since: Option<u64>,
    ) -> Result<Vec<SourceIssue>> {
        let url = format!("{}/issues", self.project_url(repository));
        let mut issues = Vec::new();
        let mut page = 1usize;

        'pages: loop {
            let query = [
                ("scope", "all".to_string()),
                ("order_by", "created_at".to_string()),
                ("sort", "desc".to_string()),
                ("per_page", PER_PAGE.to_string()),
                ("page", page.to_string()),
            ];
            let items = self.fetch_page(&url, &query).await?;
            let count = items.len();

            for issue in items.iter().filter_map(parse_issue) {
                if since.is_some_and(|s| issue.id <= s) {
                    break 'pages;
                }
                issues.push(issue);
            }

            if count < PER_PAGE {
                break;
            }
            page += 1;
        }

        issues.sort_by_key(|issue| issue.id);
        debug!(repo = %repository, count = issues.len(), ?since, "gitlab issues listed");
        Ok(issues)
    }

    async fn list_comments(
        &self,
        repository: &Repository,
        issue_id: u64,
    ) -> Result<Vec<SourceComment>> {
        let url = format!("{}/issues/{}/notes", self.project_url(repository), issue_id);
        let mut comments = Vec::new();
        let mut page = 1usize;

        loop {
            let query = [
                ("order_by", "created_at".to_string()),
                ("sort", "asc".to_string()),
                ("per_page", PER_PAGE.to_string()),
                ("page", page.to_string()),
            ];
            let items = self.fetch_page(&url, &query).await?;
            comments.extend(items.iter().filter_map(parse_note));
            if items.len() < PER_PAGE {
                break;
            }
            page += 1;
        }

        Ok(comments)
    }

    async fn fetch_issue(
        &self,
        repository: &Repository,
        reference: &str,
    ) -> Result<Option<SourceIssue>> {
        let Some(iid) = parse_hash_reference(reference) else {
            return Ok(None);
        };
        let url = format!("{}/issues/{}", self.project_url(repository), iid);
        let response =
            http::send_with_retry(&self.policy, "gitlab", || self.get(&url, &[]), FAIL).await?;
        Ok(http::json_or_none(response, "gitlab", FAIL)
            .await?
            .as_ref()
            .and_then(parse_issue))
    }
}
