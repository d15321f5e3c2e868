#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use similar_issues::embedding::Embedder;
use similar_issues::error::{Result, RetrievalError};
use similar_issues::models::{Repository, SourceComment, SourceIssue};
use similar_issues::sources::{ItemSource, StaticSource};

/// Vocabulary axes for [`TopicEmbedder`].
const TOPICS: [&str; 6] = ["login", "crash", "slow", "upload", "email", "theme"];

/// Deterministic embedder: one axis per topic word plus a small bias so no
/// vector is all zeros. Records every text it embeds and can be told to
/// fail specific calls.
pub struct TopicEmbedder {
    calls: AtomicUsize,
    embedded: Mutex<Vec<String>>,
    fail_calls: Mutex<HashSet<usize>>,
}

impl TopicEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            embedded: Mutex::new(Vec::new()),
            fail_calls: Mutex::new(HashSet::new()),
        }
    }

    /// Fail the embed call with this zero-based call number.
    pub fn fail_call(&self, call: usize) {
        self.fail_calls.lock().unwrap().insert(call);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn embedded(&self) -> Vec<String> {
        self.embedded.lock().unwrap().clone()
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut v: Vec<f32> = TOPICS
            .iter()
            .map(|t| lower.matches(t).count() as f32)
            .collect();
        v.push(0.05);
        v
    }
}

#[async_trait]
impl Embedder for TopicEmbedder {
    fn model_name(&self) -> &str {
        "topic-test"
    }

    fn dims(&self) -> usize {
        TOPICS.len() + 1
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_calls.lock().unwrap().contains(&call) {
            return Err(RetrievalError::EmbeddingFailure(format!(
                "injected failure on call {}",
                call
            )));
        }
        self.embedded.lock().unwrap().extend(texts.iter().cloned());
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Occurrences of `text` among embedded texts.
pub fn count_of(embedded: &[String], text: &str) -> usize {
    embedded.iter().filter(|t| t.as_str() == text).count()
}

pub fn issue(id: u64, title: &str, body: &str) -> SourceIssue {
    SourceIssue {
        id,
        reference: format!("#{}", id),
        url: Some(format!("https://github.com/acme/widgets/issues/{}", id)),
        title: title.to_string(),
        body: body.to_string(),
        author: Some("reporter".to_string()),
        created_at: Utc::now(),
        is_pull_request: false,
    }
}

pub fn comment(id: u64, body: &str) -> SourceComment {
    SourceComment {
        id,
        body: body.to_string(),
        author: Some("commenter".to_string()),
        created_at: Utc::now(),
    }
}

/// Item source with a separate [`StaticSource`] per repository.
#[derive(Default)]
pub struct RepoSource {
    repos: Mutex<HashMap<String, Arc<StaticSource>>>,
}

impl RepoSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repo(&self, full_name: &str) -> Arc<StaticSource> {
        self.repos
            .lock()
            .unwrap()
            .entry(full_name.to_string())
            .or_insert_with(|| Arc::new(StaticSource::new()))
            .clone()
    }
}

#[async_trait]
impl ItemSource for RepoSource {
    fn name(&self) -> &str {
        "per-repo"
    }

    async fn list_issues(
        &self,
        repository: &Repository,
        since: Option<u64>,
    ) -> Result<Vec<SourceIssue>> {
        self.repo(&repository.full_name())
            .list_issues(repository, since)
            .await
    }

    async fn list_comments(
        &self,
        repository: &Repository,
        issue_id: u64,
    ) -> Result<Vec<SourceComment>> {
        self.repo(&repository.full_name())
            .list_comments(repository, issue_id)
            .await
    }

    async fn fetch_issue(
        &self,
        repository: &Repository,
        reference: &str,
    ) -> Result<Option<SourceIssue>> {
        self.repo(&repository.full_name())
            .fetch_issue(repository, reference)
            .await
    }
}
