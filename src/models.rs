//! Core data models used throughout the engine.
//!
//! These types represent the repositories, source issues, indexed items,
//! markers, and search results that flow through indexing and retrieval.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;

/// A repository identified by `owner/name`.
///
/// GitLab subgroups are allowed in the owner part (`group/sub/name`); the
/// last path segment is always the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Repository {
    pub owner: String,
    pub name: String,
}

impl Repository {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Partition key for this repository within a corpus (`issues`, `jira`).
    pub fn partition(&self, corpus: &str) -> String {
        format!("{}:{}", corpus, self.full_name())
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for Repository {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches('/');
        match trimmed.rsplit_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() => {
                Ok(Repository::new(owner, name))
            }
            _ => Err(RetrievalError::Configuration(format!(
                "repository must be 'owner/name', got '{}'",
                s
            ))),
        }
    }
}

/// Granularity of an indexed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemLevel {
    Issue,
    Comment,
}

impl ItemLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemLevel::Issue => "issue",
            ItemLevel::Comment => "comment",
        }
    }
}

impl FromStr for ItemLevel {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "issue" => Ok(ItemLevel::Issue),
            "comment" => Ok(ItemLevel::Comment),
            other => Err(RetrievalError::VectorStoreFailure(format!(
                "unknown item level '{}'",
                other
            ))),
        }
    }
}

/// An issue or ticket as returned by an item source.
#[derive(Debug, Clone)]
pub struct SourceIssue {
    /// Monotonic numeric identifier (issue number, GitLab iid, Jira id).
    pub id: u64,
    /// Human-facing reference (`#12`, `PROJ-7`).
    pub reference: String,
    pub url: Option<String>,
    pub title: String,
    pub body: String,
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Pull/merge requests are query sources only and never indexed.
    pub is_pull_request: bool,
}

impl SourceIssue {
    /// Text embedded for the issue itself.
    pub fn embed_text(&self) -> String {
        join_title_body(&self.title, &self.body)
    }
}

/// A comment on an issue or ticket.
#[derive(Debug, Clone)]
pub struct SourceComment {
    pub id: u64,
    pub body: String,
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One embeddable unit stored in the vector store.
///
/// Unique per `(partition, external_id(), level)`.
#[derive(Debug, Clone)]
pub struct IndexedItem {
    pub partition: String,
    pub issue_id: u64,
    pub level: ItemLevel,
    /// 0 for the issue itself, 1.. for its comments in source order.
    pub ordinal: u32,
    pub reference: String,
    pub url: Option<String>,
    pub title: String,
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
    pub text: String,
    pub vector: Vec<f32>,
}

impl IndexedItem {
    /// External identifier: the issue id, or `id.c<ordinal>` for a comment.
    pub fn external_id(&self) -> String {
        match self.level {
            ItemLevel::Issue => self.issue_id.to_string(),
            ItemLevel::Comment => format!("{}.c{}", self.issue_id, self.ordinal),
        }
    }

    /// Fully qualified unique key used by backends that need a single id.
    pub fn unique_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.partition,
            self.external_id(),
            self.level.as_str()
        )
    }
}

/// Per-partition indexing progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexMarker {
    pub partition: String,
    pub indexed: bool,
    pub highest_seen: Option<u64>,
    pub embedding_dimension: usize,
    pub last_indexed_at: DateTime<Utc>,
}

/// The MR/PR (or issue) a similarity search is run for.
#[derive(Debug, Clone)]
pub struct TriggeringItem {
    /// Reference results are reported against (`!42`, `#42`, `PROJ-9`).
    pub reference: String,
    /// Numeric id when known; used to ignore self-references.
    pub number: Option<u64>,
    pub title: String,
    pub description: String,
}

impl TriggeringItem {
    pub fn text(&self) -> String {
        join_title_body(&self.title, &self.description)
    }
}

/// Where the query text came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuerySource {
    Trigger,
    CrossReference { reference: String },
}

/// A resolved retrieval query.
#[derive(Debug, Clone)]
pub struct Query {
    pub text: String,
    pub source: QuerySource,
    /// Always the triggering item's reference, never the cross-referenced one.
    pub trigger: String,
    pub partition: String,
}

/// A single hit from a vector store query.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub reference: String,
    pub issue_id: u64,
    pub level: ItemLevel,
    pub ordinal: u32,
    pub title: String,
    pub url: Option<String>,
    pub author: Option<String>,
    pub score: f32,
    pub snippet: String,
}

/// Ranked similar items for one trigger, descending by score.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub trigger: String,
    pub query_source: QuerySource,
    pub hits: Vec<SearchHit>,
}

/// User-visible outcome of a similarity search.
#[derive(Debug)]
pub enum SearchOutcome {
    Found(SearchResult),
    NoSimilarItems { trigger: String },
    Unavailable { reason: String },
}

impl SearchOutcome {
    pub fn message(&self) -> String {
        match self {
            SearchOutcome::Found(result) => format!(
                "found {} similar items for {}",
                result.hits.len(),
                result.trigger
            ),
            SearchOutcome::NoSimilarItems { trigger } => {
                format!("no similar items found for {}", trigger)
            }
            SearchOutcome::Unavailable { reason } => {
                format!("could not complete similarity search: {}", reason)
            }
        }
    }
}

fn join_title_body(title: &str, body: &str) -> String {
    let title = title.trim();
    let body = body.trim();
    match (title.is_empty(), body.is_empty()) {
        (false, false) => format!("{}\n{}", title, body),
        (false, true) => title.to_string(),
        _ => body.to_string(),
    }
}

/// First `max_chars` characters of `text`, for display.
pub fn snippet(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_parse() {
        let repo: Repository = "acme/widgets".parse().unwrap();
        assert_eq!(repo.owner, "acme");
        assert_eq!(repo.name, "widgets");
        assert_eq!(repo.partition("issues"), "issues:acme/widgets");

        let nested: Repository = "group/sub/project".parse().unwrap();
        assert_eq!(nested.owner, "group/sub");
        assert_eq!(nested.name, "project");

        assert!("widgets".parse::<Repository>().is_err());
        assert!("/widgets".parse::<Repository>().is_err());
    }

    #[test]
    fn test_external_id_and_key() {
        let mut item = IndexedItem {
            partition: "issues:acme/widgets".to_string(),
            issue_id: 7,
            level: ItemLevel::Issue,
            ordinal: 0,
            reference: "#7".to_string(),
            url: None,
            title: "crash".to_string(),
            author: None,
            created_at: Utc::now(),
            text: "crash".to_string(),
            vector: vec![],
        };
        assert_eq!(item.external_id(), "7");
        assert_eq!(item.unique_key(), "issues:acme/widgets|7|issue");

        item.level = ItemLevel::Comment;
        item.ordinal = 2;
        assert_eq!(item.external_id(), "7.c2");
        assert_eq!(item.unique_key(), "issues:acme/widgets|7.c2|comment");
    }

    #[test]
    fn test_trigger_text_joins_title_and_description() {
        let trigger = TriggeringItem {
            reference: "!3".to_string(),
            number: Some(3),
            title: "Fix login".to_string(),
            description: "  Handles expired tokens.  ".to_string(),
        };
        assert_eq!(trigger.text(), "Fix login\nHandles expired tokens.");

        let bare = TriggeringItem {
            description: String::new(),
            ..trigger
        };
        assert_eq!(bare.text(), "Fix login");
    }

    #[test]
    fn test_outcome_messages_are_distinct() {
        let none = SearchOutcome::NoSimilarItems {
            trigger: "#1".to_string(),
        };
        let down = SearchOutcome::Unavailable {
            reason: "qdrant timeout".to_string(),
        };
        assert!(none.message().starts_with("no similar items found"));
        assert!(down
            .message()
            .starts_with("could not complete similarity search"));
    }
}
