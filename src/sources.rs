//! Issue and ticket sources.
//!
//! An [`ItemSource`] lists a repository's issues (or a project's tickets)
//! and their comments. The engine indexes whatever the source returns; the
//! platform adapters live in their own modules:
//!
//! | `issue_provider.provider` | Adapter | Corpus |
//! |---------------------------|---------|--------|
//! | `github` | [`GitHubIssues`](crate::source_github::GitHubIssues) | `issues` |
//! | `gitlab` | [`GitLabIssues`](crate::source_gitlab::GitLabIssues) | `issues` |
//! | `jira` | [`JiraTickets`](crate::source_jira::JiraTickets) | `jira` |
//!
//! [`StaticSource`] serves a fixed list from memory.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{Result, RetrievalError};
use crate::models::{Repository, SourceComment, SourceIssue};
use crate::query::IssueProvider;
use crate::source_github::GitHubIssues;
use crate::source_gitlab::GitLabIssues;
use crate::source_jira::JiraTickets;

// ═══════════════════════════════════════════════════════════════════════
// ItemSource Trait
// ═══════════════════════════════════════════════════════════════════════

/// A platform that yields issues and comments for one repository.
///
/// Identifiers returned by [`list_issues`](ItemSource::list_issues) must be
/// monotonic: a newer issue always has a larger `id`.
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// Short label for logs (`github`, `gitlab`, `jira`).
    fn name(&self) -> &str;

    /// Issues with `id > since` (all issues when `since` is `None`),
    /// ascending by id, pull/merge requests excluded.
    async fn list_issues(
        &self,
        repository: &Repository,
        since: Option<u64>,
    ) -> Result<Vec<SourceIssue>>;

    /// Comments of one issue in source order.
    async fn list_comments(
        &self,
        repository: &Repository,
        issue_id: u64,
    ) -> Result<Vec<SourceComment>>;

    /// Look up one issue by its human-facing reference (`#12`, `PROJ-7`).
    /// Returns `None` when it does not exist.
    async fn fetch_issue(
        &self,
        repository: &Repository,
        reference: &str,
    ) -> Result<Option<SourceIssue>>;
}

/// Build the adapter selected by `issue_provider.provider`, together with
/// the matching [`IssueProvider`] for query resolution.
pub fn open_source(config: &Config) -> Result<(Arc<dyn ItemSource>, IssueProvider)> {
    let providers = &config.issue_provider;
    match providers.provider.as_str() {
        "github" => {
            let github = providers.github.clone().unwrap_or_default();
            Ok((Arc::new(GitHubIssues::new(&github)?), IssueProvider::GitHub))
        }
        "gitlab" => {
            let gitlab = providers.gitlab.clone().unwrap_or_default();
            Ok((Arc::new(GitLabIssues::new(&gitlab)?), IssueProvider::GitLab))
        }
        "jira" => {
            let jira = providers.jira.as_ref().ok_or_else(|| {
                RetrievalError::Configuration(
                    "issue_provider.jira section is required for provider 'jira'".to_string(),
                )
            })?;
            Ok((
                Arc::new(JiraTickets::new(jira)?),
                IssueProvider::Jira {
                    project_key: jira.project_key.clone(),
                },
            ))
        }
        other => Err(RetrievalError::Configuration(format!(
            "unknown issue provider: {}",
            other
        ))),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// StaticSource
// ═══════════════════════════════════════════════════════════════════════

/// In-memory source with failure injection.
#[derive(Default)]
pub struct StaticSource {
    issues: RwLock<BTreeMap<u64, SourceIssue>>,
    comments: RwLock<BTreeMap<u64, Vec<SourceComment>>>,
    list_calls: AtomicUsize,
    failing: AtomicBool,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_issues(issues: Vec<SourceIssue>) -> Self {
        let source = Self::new();
        for issue in issues {
            source.add_issue(issue);
        }
        source
    }

    pub fn add_issue(&self, issue: SourceIssue) {
        self.issues.write().unwrap().insert(issue.id, issue);
    }

    pub fn add_comment(&self, issue_id: u64, comment: SourceComment) {
        self.comments
            .write()
            .unwrap()
            .entry(issue_id)
            .or_default()
            .push(comment);
    }

    /// Make every call fail with [`RetrievalError::ItemSource`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `list_issues` calls so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RetrievalError::ItemSource(
                "static source marked failing".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ItemSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn list_issues(
        &self,
        _repository: &Repository,
        since: Option<u64>,
    ) -> Result<Vec<SourceIssue>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self
            .issues
            .read()
            .unwrap()
            .values()
            .filter(|issue| since.map_or(true, |s| issue.id > s))
            .filter(|issue| !issue.is_pull_request)
            .cloned()
            .collect())
    }

    async fn list_comments(
        &self,
        _repository: &Repository,
        issue_id: u64,
    ) -> Result<Vec<SourceComment>> {
        self.check()?;
        Ok(self
            .comments
            .read()
            .unwrap()
            .get(&issue_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_issue(
        &self,
        _repository: &Repository,
        reference: &str,
    ) -> Result<Option<SourceIssue>> {
        self.check()?;
        Ok(self
            .issues
            .read()
            .unwrap()
            .values()
            .find(|issue| issue.reference == reference)
            .cloned())
    }
}
