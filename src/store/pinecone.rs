//! Pinecone backend over the control-plane and data-plane REST APIs.
//!
//! The control plane (`api.pinecone.io`) describes, creates, and deletes the
//! serverless index and reports its data-plane host. Vectors are upserted
//! into a namespace named after the partition, and queries run in that
//! namespace with an additional `partition` metadata filter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{read_secret, PineconeConfig, VectorStoreConfig};
use crate::error::{Result, RetrievalError};
use crate::http::{self, RetryPolicy};
use crate::models::{IndexedItem, SearchHit};

use super::{hit_from_payload, item_payload, rank_hits, VectorStore};

const FAIL: fn(String) -> RetrievalError = RetrievalError::VectorStoreFailure;
const API_VERSION: &str = "2024-07";
/// Upper bound on vectors per upsert request.
const UPSERT_CHUNK: usize = 100;
const READY_POLLS: u32 = 30;

/// Index description returned by the control plane.
#[derive(Debug, Clone, PartialEq)]
struct IndexDescription {
    dimension: usize,
    host: String,
    ready: bool,
}

pub struct PineconeStore {
    client: Client,
    control_url: String,
    index_name: String,
    api_key: String,
    cloud: String,
    region: String,
    policy: RetryPolicy,
    host: RwLock<Option<String>>,
}

impl PineconeStore {
    pub fn new(vs: &VectorStoreConfig, config: &PineconeConfig) -> Result<Self> {
        let api_key = read_secret(&config.api_key_env).ok_or_else(|| {
            RetrievalError::Configuration(format!(
                "Pinecone API key not set: export {}",
                config.api_key_env
            ))
        })?;

        Ok(Self {
            client: http::client(vs.timeout_secs)?,
            control_url: config.control_url.trim_end_matches('/').to_string(),
            index_name: vs.collection.clone(),
            api_key,
            cloud: config.cloud.clone(),
            region: config.region.clone(),
            policy: RetryPolicy::new(vs.max_retries, vs.retry_base_ms),
            host: RwLock::new(None),
        })
    }

    fn with_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
    }

    async fn send(
        &self,
        label: &str,
        method: Method,
        url: String,
        body: Option<Value>,
    ) -> Result<reqwest::Response> {
        http::send_with_retry(
            &self.policy,
            label,
            || {
                let builder = self.with_headers(self.client.request(method.clone(), &url));
                match &body {
                    Some(body) => builder.json(body),
                    None => builder,
                }
            },
            FAIL,
        )
        .await
    }

    async fn describe_index(&self) -> Result<Option<IndexDescription>> {
        let url = format!("{}/indexes/{}", self.control_url, self.index_name);
        let response = self
            .send("pinecone describe index", Method::GET, url, None)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let json = http::json_or_fail(response, "pinecone describe index", FAIL).await?;
        parse_index_description(&json).map(Some)
    }

    async fn delete_index(&self) -> Result<()> {
        let url = format!("{}/indexes/{}", self.control_url, self.index_name);
        let response = self
            .send("pinecone delete index", Method::DELETE, url, None)
            .await?;
        let status = response.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(FAIL(format!(
                "pinecone delete index error {}: {}",
                status, body
            )));
        }
        *self.host.write().await = None;
        Ok(())
    }

    async fn create_index(&self, dimension: usize) -> Result<()> {
        let url = format!("{}/indexes", self.control_url);
        let response = self
            .send(
                "pinecone create index",
                Method::POST,
                url,
                Some(json!({
                    "name": self.index_name,
                    "dimension": dimension,
                    "metric": "cosine",
                    "spec": { "serverless": { "cloud": self.cloud, "region": self.region } },
                })),
            )
            .await?;
        if response.status() != StatusCode::CONFLICT {
            http::json_or_fail(response, "pinecone create index", FAIL).await?;
        }
        info!(index = %self.index_name, dimension, "pinecone index created");
        self.wait_until_ready(Some(dimension)).await
    }

    fn poll_interval(&self) -> Duration {
        self.policy.base_delay.max(Duration::from_millis(50))
    }

    /// Wait for a ready index, and with `dimension` set, for one of that
    /// dimension. An index still terminating after a delete keeps its old
    /// dimension and is not accepted.
    async fn wait_until_ready(&self, dimension: Option<usize>) -> Result<()> {
        for attempt in 0..READY_POLLS {
            if let Some(description) = self.describe_index().await? {
                let matches = dimension.map_or(true, |d| d == description.dimension);
                if description.ready && matches {
                    *self.host.write().await = Some(description.host);
                    return Ok(());
                }
            }
            debug!(attempt, "waiting for pinecone index");
            tokio::time::sleep(self.poll_interval()).await;
        }
        Err(FAIL(format!(
            "pinecone index '{}' not ready after {} polls",
            self.index_name, READY_POLLS
        )))
    }

    /// Index deletion is asynchronous; creating under the same name only
    /// works once the old index is gone.
    async fn wait_until_deleted(&self) -> Result<()> {
        for attempt in 0..READY_POLLS {
            if self.describe_index().await?.is_none() {
                return Ok(());
            }
            debug!(attempt, "waiting for pinecone index deletion");
            tokio::time::sleep(self.poll_interval()).await;
        }
        Err(FAIL(format!(
            "pinecone index '{}' still terminating after {} polls",
            self.index_name, READY_POLLS
        )))
    }

    /// Data-plane base URL, resolved from the control plane on first use.
    async fn data_url(&self) -> Result<String> {
        if let Some(host) = self.host.read().await.as_ref() {
            return Ok(host.clone());
        }
        let description = self.describe_index().await?.ok_or_else(|| {
            FAIL(format!("pinecone index '{}' does not exist", self.index_name))
        })?;
        *self.host.write().await = Some(description.host.clone());
        Ok(description.host)
    }
}

fn parse_index_description(json: &Value) -> Result<IndexDescription> {
    let dimension = json
        .get("dimension")
        .and_then(|d| d.as_u64())
        .ok_or_else(|| FAIL("pinecone index description has no dimension".to_string()))?;
    let host = json
        .get("host")
        .and_then(|h| h.as_str())
        .ok_or_else(|| FAIL("pinecone index description has no host".to_string()))?;
    let host = if host.starts_with("http://") || host.starts_with("https://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", host.trim_end_matches('/'))
    };
    let ready = json
        .pointer("/status/ready")
        .and_then(|r| r.as_bool())
        .unwrap_or(false);

    Ok(IndexDescription {
        dimension: dimension as usize,
        host,
        ready,
    })
}

#[async_trait]
impl VectorStore for PineconeStore {
    fn backend_name(&self) -> &str {
        "pinecone"
    }

    async fn ensure_collection(&self, dimension: usize, recreate: bool) -> Result<()> {
        if recreate {
            self.delete_index().await?;
            self.wait_until_deleted().await?;
        } else if self.describe_index().await?.is_some() {
            return self.wait_until_ready(None).await;
        }
        self.create_index(dimension).await
    }

    async fn upsert(&self, items: &[IndexedItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let base = self.data_url().await?;

        // A namespace per partition; one batch may span partitions.
        let mut by_partition: Vec<(&str, Vec<Value>)> = Vec::new();
        for item in items {
            let vector = json!({
                "id": item.unique_key(),
                "values": item.vector,
                "metadata": item_payload(item),
            });
            match by_partition.iter_mut().find(|(p, _)| *p == item.partition) {
                Some((_, vectors)) => vectors.push(vector),
                None => by_partition.push((item.partition.as_str(), vec![vector])),
            }
        }

        for (partition, vectors) in by_partition {
            for chunk in vectors.chunks(UPSERT_CHUNK) {
                let response = self
                    .send(
                        "pinecone upsert",
                        Method::POST,
                        format!("{}/vectors/upsert", base),
                        Some(json!({ "vectors": chunk, "namespace": partition })),
                    )
                    .await?;
                http::json_or_fail(response, "pinecone upsert", FAIL).await?;
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        partition: &str,
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let base = self.data_url().await?;
        let response = self
            .send(
                "pinecone query",
                Method::POST,
                format!("{}/query", base),
                Some(json!({
                    "vector": vector,
                    "topK": top_k,
                    "namespace": partition,
                    "includeMetadata": true,
                    "filter": { "partition": { "$eq": partition } },
                })),
            )
            .await?;
        let json = http::json_or_fail(response, "pinecone query", FAIL).await?;

        let matches = json
            .get("matches")
            .and_then(|m| m.as_array())
            .cloned()
            .unwrap_or_default();

        let mut hits = Vec::with_capacity(matches.len());
        for m in &matches {
            let score = m.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0) as f32;
            let metadata = m.get("metadata").cloned().unwrap_or(Value::Null);
            hits.push(hit_from_payload(&metadata, score)?);
        }
        Ok(rank_hits(hits, top_k))
    }

    async fn collection_dimension(&self) -> Result<Option<usize>> {
        Ok(self.describe_index().await?.map(|d| d.dimension))
    }

    async fn delete_partition(&self, partition: &str) -> Result<()> {
        let base = match self.describe_index().await? {
            Some(description) => description.host,
            None => return Ok(()),
        };
        let response = self
            .send(
                "pinecone delete namespace",
                Method::POST,
                format!("{}/vectors/delete", base),
                Some(json!({ "deleteAll": true, "namespace": partition })),
            )
            .await?;
        // Unknown namespace: nothing to delete.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        http::json_or_fail(response, "pinecone delete namespace", FAIL).await?;
        Ok(())
    }
}
