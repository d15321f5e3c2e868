//! In-memory [`VectorStore`] implementation for tests and embedding callers.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Vector search is brute-force
//! cosine similarity over the queried partition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{Result, RetrievalError};
use crate::models::{snippet, IndexedItem, SearchHit};

use super::{rank_hits, VectorStore};

/// In-memory store keyed by [`IndexedItem::unique_key`].
pub struct InMemoryStore {
    dimension: RwLock<Option<usize>>,
    items: RwLock<HashMap<String, IndexedItem>>,
    upserted: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            dimension: RwLock::new(None),
            items: RwLock::new(HashMap::new()),
            upserted: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Number of distinct items stored.
    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct items stored under `partition`.
    pub fn partition_len(&self, partition: &str) -> usize {
        self.items
            .read()
            .unwrap()
            .values()
            .filter(|item| item.partition == partition)
            .count()
    }

    /// Total items passed to `upsert`, duplicates included.
    pub fn upserted_count(&self) -> usize {
        self.upserted.load(Ordering::SeqCst)
    }

    /// Make every operation fail with [`RetrievalError::VectorStoreFailure`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RetrievalError::VectorStoreFailure(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn ensure_collection(&self, dimension: usize, recreate: bool) -> Result<()> {
        self.check_available()?;
        let mut dim = self.dimension.write().unwrap();
        if recreate {
            self.items.write().unwrap().clear();
            *dim = Some(dimension);
        } else if dim.is_none() {
            *dim = Some(dimension);
        }
        Ok(())
    }

    async fn upsert(&self, items: &[IndexedItem]) -> Result<()> {
        self.check_available()?;
        let mut stored = self.items.write().unwrap();
        for item in items {
            stored.insert(item.unique_key(), item.clone());
        }
        self.upserted.fetch_add(items.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        partition: &str,
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        self.check_available()?;
        let stored = self.items.read().unwrap();
        let hits: Vec<SearchHit> = stored
            .values()
            .filter(|item| item.partition == partition)
            .map(|item| SearchHit {
                reference: item.reference.clone(),
                issue_id: item.issue_id,
                level: item.level,
                ordinal: item.ordinal,
                title: item.title.clone(),
                url: item.url.clone(),
                author: item.author.clone(),
                score: cosine_similarity(vector, &item.vector),
                snippet: snippet(&item.text, 240),
            })
            .collect();
        Ok(rank_hits(hits, top_k))
    }

    async fn collection_dimension(&self) -> Result<Option<usize>> {
        self.check_available()?;
        Ok(*self.dimension.read().unwrap())
    }

    async fn delete_partition(&self, partition: &str) -> Result<()> {
        self.check_available()?;
        self.items
            .write()
            .unwrap()
            .retain(|_, item| item.partition != partition);
        Ok(())
    }
}
