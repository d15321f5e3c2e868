//! Qdrant backend over the REST API.
//!
//! One collection holds every partition. Each point carries the item
//! metadata as payload, and queries filter on the `partition` payload key,
//! which gets a keyword index when the collection is created.
//!
//! Point ids must be unsigned integers or UUIDs, so the item's unique key is
//! mapped to a deterministic UUIDv5. Re-upserting an item overwrites its
//! point.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::config::{read_secret, QdrantConfig, VectorStoreConfig};
use crate::error::{Result, RetrievalError};
use crate::http::{self, RetryPolicy};
use crate::models::{IndexedItem, SearchHit};

use super::{hit_from_payload, item_payload, rank_hits, VectorStore};

const FAIL: fn(String) -> RetrievalError = RetrievalError::VectorStoreFailure;

pub struct QdrantStore {
    client: Client,
    base_url: String,
    collection: String,
    api_key: Option<String>,
    policy: RetryPolicy,
}

impl QdrantStore {
    pub fn new(vs: &VectorStoreConfig, config: &QdrantConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(read_secret(var).ok_or_else(|| {
                RetrievalError::Configuration(format!(
                    "Qdrant API key not set: export {}",
                    var
                ))
            })?),
            None => None,
        };

        Ok(Self {
            client: http::client(vs.timeout_secs)?,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: vs.collection.clone(),
            api_key,
            policy: RetryPolicy::new(vs.max_retries, vs.retry_base_ms),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/collections/{}{}", self.base_url, self.collection, path);
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn send(
        &self,
        label: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response> {
        http::send_with_retry(
            &self.policy,
            label,
            || {
                let builder = self.request(method.clone(), path);
                match &body {
                    Some(body) => builder.json(body),
                    None => builder,
                }
            },
            FAIL,
        )
        .await
    }

    async fn create_collection(&self, dimension: usize) -> Result<()> {
        let response = self
            .send(
                "qdrant create collection",
                Method::PUT,
                "",
                Some(json!({
                    "vectors": { "size": dimension, "distance": "Cosine" }
                })),
            )
            .await?;
        // 409: created concurrently by another process.
        if response.status() != StatusCode::CONFLICT {
            http::json_or_fail(response, "qdrant create collection", FAIL).await?;
        }

        let response = self
            .send(
                "qdrant payload index",
                Method::PUT,
                "/index?wait=true",
                Some(json!({ "field_name": "partition", "field_schema": "keyword" })),
            )
            .await?;
        http::json_or_fail(response, "qdrant payload index", FAIL).await?;
        Ok(())
    }
}

/// Deterministic point id for an item.
pub fn point_id(item: &IndexedItem) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, item.unique_key().as_bytes()).to_string()
}

fn partition_filter(partition: &str) -> Value {
    json!({
        "must": [ { "key": "partition", "match": { "value": partition } } ]
    })
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn backend_name(&self) -> &str {
        "qdrant"
    }

    async fn ensure_collection(&self, dimension: usize, recreate: bool) -> Result<()> {
        if recreate {
            let response = self
                .send("qdrant delete collection", Method::DELETE, "", None)
                .await?;
            if response.status() != StatusCode::NOT_FOUND {
                http::json_or_fail(response, "qdrant delete collection", FAIL).await?;
            }
        } else if self.collection_dimension().await?.is_some() {
            return Ok(());
        }
        self.create_collection(dimension).await
    }

    async fn upsert(&self, items: &[IndexedItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let points: Vec<Value> = items
            .iter()
            .map(|item| {
                json!({
                    "id": point_id(item),
                    "vector": item.vector,
                    "payload": item_payload(item),
                })
            })
            .collect();

        let response = self
            .send(
                "qdrant upsert",
                Method::PUT,
                "/points?wait=true",
                Some(json!({ "points": points })),
            )
            .await?;
        http::json_or_fail(response, "qdrant upsert", FAIL).await?;
        debug!(count = items.len(), "qdrant upserted points");
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        partition: &str,
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let response = self
            .send(
                "qdrant search",
                Method::POST,
                "/points/search",
                Some(json!({
                    "vector": vector,
                    "limit": top_k,
                    "with_payload": true,
                    "filter": partition_filter(partition),
                })),
            )
            .await?;
        let json = http::json_or_fail(response, "qdrant search", FAIL).await?;

        let points = json
            .get("result")
            .and_then(|r| r.as_array())
            .ok_or_else(|| FAIL("qdrant search: missing 'result' array".to_string()))?;

        let mut hits = Vec::with_capacity(points.len());
        for point in points {
            let score = point.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0) as f32;
            let payload = point.get("payload").cloned().unwrap_or(Value::Null);
            hits.push(hit_from_payload(&payload, score)?);
        }
        Ok(rank_hits(hits, top_k))
    }

    async fn collection_dimension(&self) -> Result<Option<usize>> {
        let response = self
            .send("qdrant get collection", Method::GET, "", None)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let json = http::json_or_fail(response, "qdrant get collection", FAIL).await?;
        let size = json
            .pointer("/result/config/params/vectors/size")
            .and_then(|s| s.as_u64())
            .ok_or_else(|| {
                FAIL("qdrant collection has no single unnamed vector config".to_string())
            })?;
        Ok(Some(size as usize))
    }

    async fn delete_partition(&self, partition: &str) -> Result<()> {
        let response = self
            .send(
                "qdrant delete points",
                Method::POST,
                "/points/delete?wait=true",
                Some(json!({ "filter": partition_filter(partition) })),
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        http::json_or_fail(response, "qdrant delete points", FAIL).await?;
        Ok(())
    }
}
