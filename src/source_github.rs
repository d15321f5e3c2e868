//! GitHub issues over the REST v3 API.
//!
//! Issues are listed newest first and paging stops at the first issue at or
//! below the marker, so a warm pass only fetches the delta. The issues
//! endpoint also returns pull requests; those carry a `pull_request` key and
//! are dropped.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing::debug;

use crate::config::{read_secret, GitHubConfig};
use crate::error::{Result, RetrievalError};
use crate::http::{self, parse_timestamp, RetryPolicy};
use crate::models::{Repository, SourceComment, SourceIssue};
use crate::sources::ItemSource;

const FAIL: fn(String) -> RetrievalError = RetrievalError::ItemSource;
const PER_PAGE: usize = 100;
const USER_AGENT: &str = concat!("similar-issues/", env!("CARGO_PKG_VERSION"));

pub struct GitHubIssues {
    client: Client,
    api_url: String,
    token: Option<String>,
    policy: RetryPolicy,
}

impl GitHubIssues {
    pub fn new(config: &GitHubConfig) -> Result<Self> {
        Ok(Self {
            client: http::client(30)?,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: read_secret(&config.token_env),
            policy: RetryPolicy::new(3, 500),
        })
    }

    fn get(&self, url: &str, query: &[(&str, String)]) -> RequestBuilder {
        let builder = self
            .client
            .get(url)
            .query(query)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn repo_url(&self, repository: &Repository) -> String {
        format!(
            "{}/repos/{}/{}",
            self.api_url, repository.owner, repository.name
        )
    }

    async fn fetch_page(&self, url: &str, query: &[(&str, String)]) -> Result<Vec<Value>> {
        let response =
            http::send_with_retry(&self.policy, "github", || self.get(url, query), FAIL).await?;
        let json = http::json_or_fail(response, "github", FAIL).await?;
        json.as_array()
            .cloned()
            .ok_or_else(|| FAIL(format!("github: expected a JSON array from {}", url)))
    }
}

/// Convert one element of the issues listing.
pub fn parse_issue(json: &Value) -> Option<SourceIssue> {
    let number = json.get("number")?.as_u64()?;
    Some(SourceIssue {
        id: number,
        reference: format!("#{}", number),
        url: json
            .get("html_url")
            .and_then(|u| u.as_str())
            .map(String::from),
        title: json
            .get("title")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string(),
        body: json
            .get("body")
            .and_then(|b| b.as_str())
            .unwrap_or_default()
            .to_string(),
        author: json
            .pointer("/user/login")
            .and_then(|l| l.as_str())
            .map(String::from),
        created_at: parse_timestamp(json.get("created_at")),
        is_pull_request: json.get("pull_request").is_some(),
    })
}

fn parse_comment(json: &Value) -> Option<SourceComment> {
    Some(SourceComment {
        id: json.get("id")?.as_u64()?,
        body: json
            .get("body")
            .and_then(|b| b.as_str())
            .unwrap_or_default()
            .to_string(),
        author: json
            .pointer("/user/login")
            .and_then(|l| l.as_str())
            .map(String::from),
        created_at: parse_timestamp(json.get("created_at")),
    })
}

/// Issue number from a `#123` reference.
pub(crate) fn parse_hash_reference(reference: &str) -> Option<u64> {
    reference.trim().trim_start_matches('#').parse().ok()
}

#[async_trait]
impl ItemSource for GitHubIssues {
    fn name(&self) -> &str {
        "github"
    }

    async fn list_issues(
        &self,
        repository: &Repository,
        since: Option<u64>,
    ) -> Result<Vec<SourceIssue>> {
        let url = format!("{}/issues", self.repo_url(repository));
        let mut issues = Vec::new();
        let mut page = 1usize;

        'pages: loop {
            let query = [
                ("state", "all".to_string()),
                ("sort", "created".to_string()),
                ("direction", "desc".to_string()),
                ("per_page", PER_PAGE.to_string()),
                ("page", page.to_string()),
            ];
            let items = self.fetch_page(&url, &query).await?;
            let count = items.len();

            for item in &items {
                let Some(issue) = parse_issue(item) else {
                    continue;
                };
                if since.is_some_and(|s| issue.id <= s) {
                    break 'pages;
                }
                if !issue.is_pull_request {
                    issues.push(issue);
                }
            }

            if count < PER_PAGE {
                break;
            }
            page += 1;
        }

        issues.sort_by_key(|issue| issue.id);
        debug!(repo = %repository, count = issues.len(), ?since, "github issues listed");
        Ok(issues)
    }

    async fn list_comments(
        &self,
        repository: &Repository,
        issue_id: u64,
    ) -> Result<Vec<SourceComment>> {
        let url = format!("{}/issues/{}/comments", self.repo_url(repository), issue_id);
        let mut comments = Vec::new();
        let mut page = 1usize;

        loop {
            let query = [
                ("per_page", PER_PAGE.to_string()),
                ("page", page.to_string()),
            ];
            let items = self.fetch_page(&url, &query).await?;
            comments.extend(items.iter().filter_map(parse_comment));
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
        let Some(number) = parse_hash_reference(reference) else {
            return Ok(None);
        };
        let url = format!("{}/issues/{}", self.repo_url(repository), number);
        let response =
            http::send_with_retry(&self.policy, "github", || self.get(&url, &[]), FAIL).await?;
        Ok(http::json_or_none(response, "github", FAIL)
            .await?
            .as_ref()
            .and_then(parse_issue))
    }
}
