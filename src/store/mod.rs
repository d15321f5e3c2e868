//! Vector store abstraction.
//!
//! The [`VectorStore`] trait is the only surface the engine sees; backend
//! wire formats stay inside each implementation. Exactly one backend is
//! selected per deployment by [`open_store`]:
//!
//! | `vector_store.backend` | Implementation | Storage |
//! |------------------------|----------------|---------|
//! | `sqlite` | [`sqlite::SqliteVectorStore`] | local database file |
//! | `qdrant` | [`qdrant::QdrantStore`] | Qdrant REST API |
//! | `pinecone` | [`pinecone::PineconeStore`] | Pinecone control + data plane |
//!
//! [`memory::InMemoryStore`] is a process-local implementation for tests
//! and embedding callers.
//!
//! All backends share one collection across repositories and must scope
//! every query to a single partition. Scores are cosine similarity in
//! `[-1, 1]`; normalization happens in the retrieval service.

pub mod memory;
pub mod pinecone;
pub mod qdrant;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Result, RetrievalError};
use crate::models::{snippet, IndexedItem, ItemLevel, SearchHit};

/// Abstract vector storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ensure_collection`](VectorStore::ensure_collection) | Create (or recreate) the shared collection |
/// | [`upsert`](VectorStore::upsert) | Insert or overwrite items by unique key |
/// | [`query`](VectorStore::query) | Top-K cosine search within one partition |
/// | [`collection_dimension`](VectorStore::collection_dimension) | Dimension of the existing collection |
/// | [`delete_partition`](VectorStore::delete_partition) | Drop every item of one partition |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Short backend identifier for logs.
    fn backend_name(&self) -> &str;

    /// Create the collection for `dimension` if missing. With `recreate`,
    /// drop the existing collection first.
    async fn ensure_collection(&self, dimension: usize, recreate: bool) -> Result<()>;

    /// Insert or overwrite items keyed by `(partition, external_id, level)`.
    async fn upsert(&self, items: &[IndexedItem]) -> Result<()>;

    /// Return up to `top_k` hits from `partition`, descending by score.
    async fn query(&self, vector: &[f32], partition: &str, top_k: usize)
        -> Result<Vec<SearchHit>>;

    /// Dimension of the existing collection, `None` when it does not exist.
    async fn collection_dimension(&self) -> Result<Option<usize>>;

    /// Remove every item stored under `partition`.
    async fn delete_partition(&self, partition: &str) -> Result<()>;
}

/// Open the backend selected by `vector_store.backend`.
pub async fn open_store(config: &Config) -> Result<Arc<dyn VectorStore>> {
    let vs = &config.vector_store;
    match vs.backend.as_str() {
        "sqlite" => {
            let pool = crate::db::open(config)
                .await
                .map_err(|e| RetrievalError::VectorStoreFailure(e.to_string()))?;
            Ok(Arc::new(sqlite::SqliteVectorStore::new(
                pool,
                vs.collection.clone(),
            )))
        }
        "qdrant" => {
            let qdrant = vs.qdrant.clone().unwrap_or_default();
            Ok(Arc::new(qdrant::QdrantStore::new(vs, &qdrant)?))
        }
        "pinecone" => {
            let pinecone = vs.pinecone.clone().unwrap_or_default();
            Ok(Arc::new(pinecone::PineconeStore::new(vs, &pinecone)?))
        }
        other => Err(RetrievalError::Configuration(format!(
            "unknown vector store backend: {}",
            other
        ))),
    }
}

/// Make sure the collection exists with the configured dimension.
///
/// Returns `true` when the collection was recreated, in which case every
/// partition is gone and all markers must be reset.
///
/// # Errors
///
/// [`RetrievalError::DimensionMismatch`] when the existing collection has a
/// different dimension and `force_rebuild` is not set.
pub async fn prepare_collection(
    store: &dyn VectorStore,
    dimension: usize,
    force_rebuild: bool,
) -> Result<bool> {
    match store.collection_dimension().await? {
        Some(existing) if existing == dimension => Ok(false),
        Some(existing) if force_rebuild => {
            warn!(
                backend = store.backend_name(),
                existing, dimension, "recreating collection after dimension change"
            );
            store.ensure_collection(dimension, true).await?;
            Ok(true)
        }
        Some(existing) => Err(RetrievalError::DimensionMismatch {
            expected: dimension,
            actual: existing,
        }),
        None => {
            info!(
                backend = store.backend_name(),
                dimension, "creating collection"
            );
            store.ensure_collection(dimension, false).await?;
            Ok(false)
        }
    }
}

/// Characters of item text kept in remote payloads.
const PAYLOAD_TEXT_CHARS: usize = 1000;

/// Metadata stored next to a vector in remote backends.
///
/// Absent optional fields are omitted rather than written as `null`, which
/// Pinecone metadata does not accept.
pub(crate) fn item_payload(item: &IndexedItem) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("partition".into(), json!(item.partition));
    payload.insert("external_id".into(), json!(item.external_id()));
    payload.insert("level".into(), json!(item.level.as_str()));
    payload.insert("issue_id".into(), json!(item.issue_id));
    payload.insert("ordinal".into(), json!(item.ordinal));
    payload.insert("reference".into(), json!(item.reference));
    payload.insert("title".into(), json!(item.title));
    payload.insert("created_at".into(), json!(item.created_at.to_rfc3339()));
    payload.insert(
        "text".into(),
        json!(snippet(&item.text, PAYLOAD_TEXT_CHARS)),
    );
    if let Some(url) = &item.url {
        payload.insert("url".into(), json!(url));
    }
    if let Some(author) = &item.author {
        payload.insert("author".into(), json!(author));
    }
    payload
}

/// Rebuild a [`SearchHit`] from a payload written by [`item_payload`].
pub(crate) fn hit_from_payload(payload: &Value, score: f32) -> Result<SearchHit> {
    let text_field = |key: &str| payload.get(key).and_then(|v| v.as_str()).map(String::from);
    // Pinecone returns every number as a float.
    let number_field = |key: &str| {
        payload
            .get(key)
            .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
    };

    let level = text_field("level")
        .ok_or_else(|| RetrievalError::VectorStoreFailure("hit payload has no level".into()))?
        .parse::<ItemLevel>()?;
    let issue_id = number_field("issue_id")
        .ok_or_else(|| RetrievalError::VectorStoreFailure("hit payload has no issue_id".into()))?;

    Ok(SearchHit {
        reference: text_field("reference").unwrap_or_else(|| issue_id.to_string()),
        issue_id,
        level,
        ordinal: number_field("ordinal").unwrap_or(0) as u32,
        title: text_field("title").unwrap_or_default(),
        url: text_field("url"),
        author: text_field("author"),
        score,
        snippet: snippet(&text_field("text").unwrap_or_default(), 240),
    })
}

/// Sort hits by descending score and keep the first `top_k`.
pub(crate) fn rank_hits(mut hits: Vec<SearchHit>, top_k: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(top_k);
    hits
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryStore;
    use super::*;

    #[tokio::test]
    async fn test_prepare_creates_missing_collection() {
        let store = InMemoryStore::new();
        assert_eq!(store.collection_dimension().await.unwrap(), None);
        let recreated = prepare_collection(&store, 3, false).await.unwrap();
        assert!(!recreated);
        assert_eq!(store.collection_dimension().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_prepare_mismatch_without_force() {
        let store = InMemoryStore::new();
        store.ensure_collection(4, false).await.unwrap();
        let err = prepare_collection(&store, 3, false).await.unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::DimensionMismatch {
                expected: 3,
                actual: 4
            }
        ));
    }

    #[test]
    fn test_payload_omits_missing_fields_and_reads_float_ids() {
        let item = IndexedItem {
            partition: "jira:acme/PROJ".to_string(),
            issue_id: 10042,
            level: ItemLevel::Comment,
            ordinal: 3,
            reference: "PROJ-7".to_string(),
            url: None,
            title: "Timeout".to_string(),
            author: None,
            created_at: chrono::Utc::now(),
            text: "still times out".to_string(),
            vector: vec![],
        };
        let payload = item_payload(&item);
        assert!(!payload.contains_key("url"));
        assert!(!payload.contains_key("author"));
        assert_eq!(payload["external_id"], "10042.c3");

        let mut as_floats = payload.clone();
        as_floats.insert("issue_id".into(), json!(10042.0));
        as_floats.insert("ordinal".into(), json!(3.0));
        let hit = hit_from_payload(&Value::Object(as_floats), 0.5).unwrap();
        assert_eq!(hit.issue_id, 10042);
        assert_eq!(hit.ordinal, 3);
        assert_eq!(hit.level, ItemLevel::Comment);
        assert_eq!(hit.snippet, "still times out");
    }

    #[tokio::test]
    async fn test_prepare_mismatch_with_force_recreates() {
        let store = InMemoryStore::new();
        store.ensure_collection(4, false).await.unwrap();
        let recreated = prepare_collection(&store, 3, true).await.unwrap();
        assert!(recreated);
        assert_eq!(store.collection_dimension().await.unwrap(), Some(3));
    }
}
