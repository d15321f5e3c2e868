//! Similar-issue retrieval for a triggering pull/merge request.
//!
//! [`RetrievalService::retrieve`] runs the full flow for one request:
//!
//! 1. Check the shared collection once per service instance.
//! 2. Bring the repository's partition up to date, holding that
//!    partition's lock so only one indexing pass runs at a time.
//! 3. Resolve the query text (trigger or cross-referenced issue).
//! 4. Embed it and search the partition.
//! 5. Normalize scores, apply the threshold, drop the trigger itself, and
//!    keep the top K.
//!
//! Indexing problems other than configuration errors do not fail the
//! request; the query runs against whatever has been committed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::builder::{IndexBuilder, IndexOptions, IndexReport};
use crate::config::{Config, RetrievalConfig};
use crate::embedding::{embed_query, validate_vectors, Embedder, HttpEmbedder};
use crate::error::{Result, RetrievalError};
use crate::models::{
    IndexMarker, Repository, SearchHit, SearchOutcome, SearchResult, TriggeringItem,
};
use crate::query::{IssueProvider, QueryResolver};
use crate::sources::{open_source, ItemSource};
use crate::state::{open_state, StateTracker};
use crate::store::{open_store, prepare_collection, VectorStore};

/// Index state of one partition, as shown by `simi status`.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStatus {
    pub partition: String,
    pub backend: String,
    pub collection_dimension: Option<usize>,
    pub marker: Option<IndexMarker>,
}

pub struct RetrievalService {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    state: Arc<dyn StateTracker>,
    builder: IndexBuilder,
    resolver: QueryResolver,
    settings: RetrievalConfig,
    force_rebuild: bool,
    /// One indexing lock per partition.
    locks: DashMap<String, Arc<Mutex<()>>>,
    collection_ready: OnceCell<()>,
    collection_recreated: AtomicBool,
    /// Partitions already force-rebuilt by this instance.
    rebuilt: DashSet<String>,
}

impl RetrievalService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        state: Arc<dyn StateTracker>,
        source: Arc<dyn ItemSource>,
        provider: IssueProvider,
        settings: RetrievalConfig,
        options: IndexOptions,
        force_rebuild: bool,
    ) -> Self {
        let builder = IndexBuilder::new(
            embedder.clone(),
            store.clone(),
            state.clone(),
            source.clone(),
            options,
        );
        Self {
            embedder,
            store,
            state,
            builder,
            resolver: QueryResolver::new(provider, source),
            settings,
            force_rebuild,
            locks: DashMap::new(),
            collection_ready: OnceCell::new(),
            collection_recreated: AtomicBool::new(false),
            rebuilt: DashSet::new(),
        }
    }

    /// Wire every component from configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(&config.embedding)?);
        let store = open_store(config).await?;
        let state = open_state(config).await?;
        let (source, provider) = open_source(config)?;
        info!(
            backend = store.backend_name(),
            model = embedder.model_name(),
            dims = embedder.dims(),
            provider = source.name(),
            "retrieval service ready"
        );
        Ok(Self::new(
            embedder,
            store,
            state,
            source,
            provider,
            config.retrieval.clone(),
            IndexOptions {
                batch_size: config.index.batch_size,
                include_comments: config.index.include_comments,
            },
            config.index.force_rebuild,
        ))
    }

    pub fn partition(&self, repository: &Repository) -> String {
        self.resolver.provider().partition(repository)
    }

    /// Check (or create) the collection once per instance. A recreated
    /// collection invalidates every marker.
    async fn ensure_collection(&self) -> Result<()> {
        self.collection_ready
            .get_or_try_init(|| async {
                let recreated = prepare_collection(
                    self.store.as_ref(),
                    self.embedder.dims(),
                    self.force_rebuild,
                )
                .await?;
                if recreated {
                    self.state.reset_all().await?;
                    self.collection_recreated.store(true, Ordering::SeqCst);
                }
                Ok::<(), RetrievalError>(())
            })
            .await
            .map(|_| ())
    }

    fn partition_lock(&self, partition: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(partition.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Bring the repository's partition up to date.
    ///
    /// Returns `Ok(None)` when the deadline passed while waiting for another
    /// pass on the same partition.
    pub async fn ensure_index(
        &self,
        repository: &Repository,
        deadline: Option<Instant>,
    ) -> Result<Option<IndexReport>> {
        self.ensure_collection().await?;

        let partition = self.partition(repository);
        let lock = self.partition_lock(&partition);
        let _guard = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, lock.lock()).await {
                Ok(guard) => guard,
                Err(_) => {
                    warn!(%partition, "deadline reached waiting for indexing lock");
                    return Ok(None);
                }
            },
            None => lock.lock().await,
        };

        let rebuild = self.force_rebuild
            && !self.collection_recreated.load(Ordering::SeqCst)
            && self.rebuilt.insert(partition.clone());

        let report = if rebuild {
            self.builder.rebuild(repository, &partition, deadline).await?
        } else {
            self.builder.build(repository, &partition, deadline).await?
        };
        Ok(Some(report))
    }

    /// Find items similar to `trigger` in `repository`'s partition.
    pub async fn retrieve(
        &self,
        repository: &Repository,
        trigger: &TriggeringItem,
        deadline: Option<Instant>,
    ) -> Result<SearchResult> {
        match self.ensure_index(repository, deadline).await {
            Ok(Some(report)) if report.is_partial() => {
                warn!(
                    partition = %report.partition,
                    failure = ?report.failure,
                    deadline_hit = report.deadline_hit,
                    "index partially updated, querying committed items"
                );
            }
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(repo = %repository, error = %e, "indexing failed, querying committed items");
            }
        }

        let query = self.resolver.resolve(repository, trigger).await;
        let vector = embed_query(self.embedder.as_ref(), &query.text).await?;
        validate_vectors(std::slice::from_ref(&vector), 1, self.embedder.dims())?;

        let candidates = self
            .query_excluding_trigger(&vector, &query.partition, &query.trigger)
            .await?;

        let mut hits: Vec<_> = candidates
            .into_iter()
            .map(|mut hit| {
                hit.score = self.settings.score.apply(hit.score);
                hit
            })
            .filter(|hit| self.settings.min_score.map_or(true, |min| hit.score >= min))
            .collect();
        hits.truncate(self.settings.top_k);

        debug!(
            partition = %query.partition,
            trigger = %query.trigger,
            source = ?query.source,
            hits = hits.len(),
            "similarity search complete"
        );

        Ok(SearchResult {
            trigger: query.trigger,
            query_source: query.source,
            hits,
        })
    }

    /// Up to `top_k` hits that do not belong to the trigger. An indexed
    /// trigger can occupy several slots (issue plus comments), so the
    /// candidate window widens until enough hits remain or the partition
    /// runs out.
    async fn query_excluding_trigger(
        &self,
        vector: &[f32],
        partition: &str,
        trigger: &str,
    ) -> Result<Vec<SearchHit>> {
        let top_k = self.settings.top_k;
        let mut limit = top_k + 1;
        loop {
            let candidates = self.store.query(vector, partition, limit).await?;
            let exhausted = candidates.len() < limit;
            let mut kept: Vec<_> = candidates
                .into_iter()
                .filter(|hit| hit.reference != trigger)
                .collect();
            if kept.len() >= top_k || exhausted {
                kept.truncate(top_k);
                return Ok(kept);
            }
            debug!(partition, limit, kept = kept.len(), "widening candidate window");
            limit *= 2;
        }
    }

    /// Like [`retrieve`](Self::retrieve), folded into a user-facing outcome.
    /// Only fatal configuration errors are returned as `Err`.
    pub async fn search(
        &self,
        repository: &Repository,
        trigger: &TriggeringItem,
        deadline: Option<Instant>,
    ) -> Result<SearchOutcome> {
        match self.retrieve(repository, trigger, deadline).await {
            Ok(result) if result.hits.is_empty() => Ok(SearchOutcome::NoSimilarItems {
                trigger: result.trigger,
            }),
            Ok(result) => Ok(SearchOutcome::Found(result)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(repo = %repository, error = %e, "similarity search unavailable");
                Ok(SearchOutcome::Unavailable {
                    reason: e.to_string(),
                })
            }
        }
    }

    pub async fn status(&self, repository: &Repository) -> Result<PartitionStatus> {
        let partition = self.partition(repository);
        Ok(PartitionStatus {
            backend: self.store.backend_name().to_string(),
            collection_dimension: self.store.collection_dimension().await?,
            marker: self.state.marker(&partition).await?,
            partition,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoreMode;
    use crate::models::{ItemLevel, QuerySource, SourceIssue};
    use crate::sources::StaticSource;
    use crate::state::InMemoryStateTracker;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;

    /// Maps a few keywords onto axes so related texts land close together.
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        fn model_name(&self) -> &str {
            "keywords"
        }

        fn dims(&self) -> usize {
            3
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![
                        t.matches("login").count() as f32 + 0.01,
                        t.matches("crash").count() as f32,
                        t.matches("slow").count() as f32,
                    ]
                })
                .collect())
        }
    }

    fn issue(id: u64, title: &str) -> SourceIssue {
        SourceIssue {
            id,
            reference: format!("#{}", id),
            url: None,
            title: title.to_string(),
            body: String::new(),
            author: None,
            created_at: Utc::now(),
            is_pull_request: false,
        }
    }

    fn service(source: Arc<StaticSource>, store: Arc<InMemoryStore>) -> RetrievalService {
        RetrievalService::new(
            Arc::new(KeywordEmbedder),
            store,
            Arc::new(InMemoryStateTracker::new()),
            source,
            IssueProvider::GitHub,
            RetrievalConfig {
                top_k: 2,
                score: ScoreMode::Raw,
                min_score: None,
            },
            IndexOptions::default(),
            false,
        )
    }

    fn trigger(description: &str) -> TriggeringItem {
        TriggeringItem {
            reference: "#100".to_string(),
            number: Some(100),
            title: String::new(),
            description: description.to_string(),
        }
    }

    #[tokio::test]
    async fn test_retrieve_ranks_and_limits() {
        let source = Arc::new(StaticSource::with_issues(vec![
            issue(1, "login page crash"),
            issue(2, "slow search"),
            issue(3, "login timeout"),
            issue(4, "crash on start"),
        ]));
        let svc = service(source, Arc::new(InMemoryStore::new()));
        let repo = Repository::new("acme", "widgets");

        let result = svc
            .retrieve(&repo, &trigger("users report login errors"), None)
            .await
            .unwrap();
        assert_eq!(result.trigger, "#100");
        assert_eq!(result.query_source, QuerySource::Trigger);
        assert_eq!(result.hits.len(), 2);
        assert_eq!(result.hits[0].reference, "#3");
        assert!(result.hits[0].score >= result.hits[1].score);
        assert_eq!(result.hits[0].level, ItemLevel::Issue);
    }

    #[tokio::test]
    async fn test_trigger_never_returned_as_hit() {
        let source = Arc::new(StaticSource::with_issues(vec![
            issue(100, "login broken"),
            issue(1, "login broken too"),
        ]));
        let svc = service(source, Arc::new(InMemoryStore::new()));
        let repo = Repository::new("acme", "widgets");

        let result = svc.retrieve(&repo, &trigger("login"), None).await.unwrap();
        assert!(result.hits.iter().all(|h| h.reference != "#100"));
        assert_eq!(result.hits.len(), 1);
    }

    #[tokio::test]
    async fn test_source_failure_degrades_to_committed_index() {
        let source = Arc::new(StaticSource::with_issues(vec![issue(1, "login crash")]));
        let store = Arc::new(InMemoryStore::new());
        let svc = service(source.clone(), store);
        let repo = Repository::new("acme", "widgets");

        svc.retrieve(&repo, &trigger("login"), None).await.unwrap();
        source.set_failing(true);
        let result = svc.retrieve(&repo, &trigger("login"), None).await.unwrap();
        assert_eq!(result.hits.len(), 1);
    }

    #[tokio::test]
    async fn test_store_outage_is_unavailable_outcome() {
        let source = Arc::new(StaticSource::with_issues(vec![issue(1, "login crash")]));
        let store = Arc::new(InMemoryStore::new());
        let svc = service(source, store.clone());
        let repo = Repository::new("acme", "widgets");

        store.set_unavailable(true);
        let outcome = svc.search(&repo, &trigger("login"), None).await.unwrap();
        assert!(matches!(outcome, SearchOutcome::Unavailable { .. }));
        assert!(outcome.message().starts_with("could not complete similarity search"));
    }

    #[tokio::test]
    async fn test_empty_repository_is_no_similar_items() {
        let svc = service(Arc::new(StaticSource::new()), Arc::new(InMemoryStore::new()));
        let repo = Repository::new("acme", "empty");
        let outcome = svc.search(&repo, &trigger("login"), None).await.unwrap();
        assert!(matches!(outcome, SearchOutcome::NoSimilarItems { .. }));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_fatal() {
        let store = Arc::new(InMemoryStore::new());
        store.ensure_collection(8, false).await.unwrap();
        let svc = service(Arc::new(StaticSource::new()), store);
        let repo = Repository::new("acme", "widgets");
        let err = svc.search(&repo, &trigger("login"), None).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
