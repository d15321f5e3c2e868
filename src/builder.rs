//! Incremental index construction for one partition.
//!
//! # Paths
//!
//! | Marker state | Path | Issues listed |
//! |--------------|------|---------------|
//! | not indexed | cold | all |
//! | indexed | warm | `id > highest_seen` |
//! | indexed, nothing new | up to date | none |
//!
//! # Batches
//!
//! Issues are processed in ascending id order, `batch_size` issues at a
//! time. Each batch is fetched (comments), embedded, upserted, and then
//! committed by advancing the marker to the batch's highest id. A batch
//! is the unit of progress:
//!
//! - a deadline stops the pass before the next batch starts;
//! - an embedding failure skips the batch and ends the pass, so the next
//!   pass resumes at exactly that batch and nothing is embedded twice;
//! - an item source or vector store failure is returned to the caller
//!   with every earlier batch already committed.

use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::embedding::{validate_vectors, Embedder};
use crate::error::Result;
use crate::models::{IndexedItem, ItemLevel, Repository, SourceIssue};
use crate::sources::ItemSource;
use crate::state::StateTracker;
use crate::store::VectorStore;

/// Which path an indexing pass took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexPath {
    Cold,
    Warm,
    UpToDate,
}

/// Summary of one indexing pass.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub partition: String,
    pub path: IndexPath,
    /// Issues returned by the source (pull requests excluded).
    pub fetched: usize,
    /// Items (issues and comments) embedded and upserted.
    pub embedded: usize,
    pub committed_batches: usize,
    /// Zero-based index of the batch whose embedding failed.
    pub failed_batch: Option<usize>,
    pub failure: Option<String>,
    pub deadline_hit: bool,
    /// Marker value after the pass.
    pub highest_seen: Option<u64>,
}

impl IndexReport {
    fn new(partition: &str, path: IndexPath, highest_seen: Option<u64>) -> Self {
        Self {
            partition: partition.to_string(),
            path,
            fetched: 0,
            embedded: 0,
            committed_batches: 0,
            failed_batch: None,
            failure: None,
            deadline_hit: false,
            highest_seen,
        }
    }

    /// True when the pass stopped before covering every fetched issue.
    pub fn is_partial(&self) -> bool {
        self.failed_batch.is_some() || self.deadline_hit
    }
}

/// Options for [`IndexBuilder`], taken from the `[index]` section.
#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    pub batch_size: usize,
    pub include_comments: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            batch_size: 32,
            include_comments: false,
        }
    }
}

pub struct IndexBuilder {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    state: Arc<dyn StateTracker>,
    source: Arc<dyn ItemSource>,
    options: IndexOptions,
}

impl IndexBuilder {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        state: Arc<dyn StateTracker>,
        source: Arc<dyn ItemSource>,
        options: IndexOptions,
    ) -> Self {
        Self {
            embedder,
            store,
            state,
            source,
            options: IndexOptions {
                batch_size: options.batch_size.max(1),
                ..options
            },
        }
    }

    /// Bring `partition` up to date with the source.
    ///
    /// The caller must hold the partition's indexing lock.
    pub async fn build(
        &self,
        repository: &Repository,
        partition: &str,
        deadline: Option<Instant>,
    ) -> Result<IndexReport> {
        let marker = self.state.marker(partition).await?;
        let (path, since) = match &marker {
            Some(m) if m.indexed => (IndexPath::Warm, m.highest_seen),
            _ => (IndexPath::Cold, None),
        };
        let mut report = IndexReport::new(
            partition,
            path,
            marker.as_ref().and_then(|m| m.highest_seen),
        );

        let mut issues = self.source.list_issues(repository, since).await?;
        issues.retain(|issue| !issue.is_pull_request && since.map_or(true, |s| issue.id > s));
        issues.sort_by_key(|issue| issue.id);
        issues.dedup_by_key(|issue| issue.id);
        report.fetched = issues.len();

        if issues.is_empty() {
            if path == IndexPath::Cold {
                // An empty corpus is still indexed; later passes go warm.
                self.state
                    .mark_indexed(partition, None, self.embedder.dims())
                    .await?;
                info!(partition, "cold pass found no issues");
            } else {
                report.path = IndexPath::UpToDate;
                debug!(partition, "index up to date");
            }
            return Ok(report);
        }

        info!(
            partition,
            path = ?path,
            issues = issues.len(),
            since = ?since,
            "indexing pass started"
        );

        for (batch_index, batch) in issues.chunks(self.options.batch_size).enumerate() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                report.deadline_hit = true;
                warn!(
                    partition,
                    batch = batch_index,
                    "deadline reached, deferring remaining batches"
                );
                break;
            }

            let items = self.collect_batch(repository, partition, batch).await?;
            let texts: Vec<String> = items.iter().map(|item| item.text.clone()).collect();

            let vectors = match self.embed_batch(&texts).await {
                Ok(vectors) => vectors,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        partition,
                        batch = batch_index,
                        error = %e,
                        "embedding failed, batch deferred to the next pass"
                    );
                    report.failed_batch = Some(batch_index);
                    report.failure = Some(e.to_string());
                    break;
                }
            };

            let items: Vec<IndexedItem> = items
                .into_iter()
                .zip(vectors)
                .map(|(item, vector)| IndexedItem { vector, ..item })
                .collect();
            self.store.upsert(&items).await?;

            let batch_highest = batch.iter().map(|issue| issue.id).max();
            self.state
                .mark_indexed(partition, batch_highest, self.embedder.dims())
                .await?;

            report.embedded += items.len();
            report.committed_batches += 1;
            report.highest_seen = report.highest_seen.max(batch_highest);
            debug!(
                partition,
                batch = batch_index,
                items = items.len(),
                highest = ?batch_highest,
                "batch committed"
            );
        }

        info!(
            partition,
            embedded = report.embedded,
            batches = report.committed_batches,
            highest = ?report.highest_seen,
            partial = report.is_partial(),
            "indexing pass finished"
        );
        Ok(report)
    }

    /// Drop the partition and its marker, then run a cold pass.
    pub async fn rebuild(
        &self,
        repository: &Repository,
        partition: &str,
        deadline: Option<Instant>,
    ) -> Result<IndexReport> {
        warn!(partition, "force rebuild: dropping partition");
        self.store.delete_partition(partition).await?;
        self.state.reset(partition).await?;
        self.build(repository, partition, deadline).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.embedder.embed(texts).await?;
        validate_vectors(&vectors, texts.len(), self.embedder.dims())?;
        Ok(vectors)
    }

    /// Items for one batch of issues, vectors not yet filled in.
    async fn collect_batch(
        &self,
        repository: &Repository,
        partition: &str,
        batch: &[SourceIssue],
    ) -> Result<Vec<IndexedItem>> {
        let mut items = Vec::new();

        for issue in batch {
            let text = issue.embed_text();
            if !text.is_empty() {
                items.push(IndexedItem {
                    partition: partition.to_string(),
                    issue_id: issue.id,
                    level: ItemLevel::Issue,
                    ordinal: 0,
                    reference: issue.reference.clone(),
                    url: issue.url.clone(),
                    title: issue.title.clone(),
                    author: issue.author.clone(),
                    created_at: issue.created_at,
                    text,
                    vector: Vec::new(),
                });
            }

            if !self.options.include_comments {
                continue;
            }
            let comments = self.source.list_comments(repository, issue.id).await?;
            for (position, comment) in comments.iter().enumerate() {
                let body = comment.body.trim();
                if body.is_empty() {
                    continue;
                }
                items.push(IndexedItem {
                    partition: partition.to_string(),
                    issue_id: issue.id,
                    level: ItemLevel::Comment,
                    ordinal: position as u32 + 1,
                    reference: issue.reference.clone(),
                    url: issue.url.clone(),
                    title: issue.title.clone(),
                    author: comment.author.clone(),
                    created_at: comment.created_at,
                    text: body.to_string(),
                    vector: Vec::new(),
                });
            }
        }

        Ok(items)
    }
}
