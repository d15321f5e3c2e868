//! Per-partition index markers.
//!
//! A marker records whether a partition has completed a cold pass and the
//! highest item id committed to the vector store. Markers only move forward:
//! [`StateTracker::mark_indexed`] never lowers `highest_seen`. Only
//! [`StateTracker::reset`] and [`StateTracker::reset_all`] clear them, which
//! happens on a forced rebuild.
//!
//! Markers live in the `index_markers` table of the local database whatever
//! vector backend is selected. [`InMemoryStateTracker`] is a process-local
//! implementation for tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::error::{Result, RetrievalError};
use crate::models::IndexMarker;

#[async_trait]
pub trait StateTracker: Send + Sync {
    /// Current marker for `partition`, if any pass has committed.
    async fn marker(&self, partition: &str) -> Result<Option<IndexMarker>>;

    /// Record committed progress. `highest_seen` is merged with the stored
    /// value by maximum.
    async fn mark_indexed(
        &self,
        partition: &str,
        highest_seen: Option<u64>,
        embedding_dimension: usize,
    ) -> Result<()>;

    /// Forget the marker for `partition`.
    async fn reset(&self, partition: &str) -> Result<()>;

    /// Forget every marker.
    async fn reset_all(&self) -> Result<()>;

    async fn is_indexed(&self, partition: &str) -> Result<bool> {
        Ok(self
            .marker(partition)
            .await?
            .map(|m| m.indexed)
            .unwrap_or(false))
    }

    async fn highest_seen(&self, partition: &str) -> Result<Option<u64>> {
        Ok(self.marker(partition).await?.and_then(|m| m.highest_seen))
    }
}

/// Open the SQLite-backed tracker on the configured database.
pub async fn open_state(config: &Config) -> Result<Arc<dyn StateTracker>> {
    let pool = crate::db::open(config)
        .await
        .map_err(|e| RetrievalError::State(e.to_string()))?;
    Ok(Arc::new(SqliteStateTracker::new(pool)))
}

fn state_err(err: sqlx::Error) -> RetrievalError {
    RetrievalError::State(err.to_string())
}

pub struct SqliteStateTracker {
    pool: SqlitePool,
}

impl SqliteStateTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateTracker for SqliteStateTracker {
    async fn marker(&self, partition: &str) -> Result<Option<IndexMarker>> {
        let row = sqlx::query(
            "SELECT indexed, highest_seen, embedding_dimension, last_indexed_at FROM index_markers WHERE partition = ?",
        )
        .bind(partition)
        .fetch_optional(&self.pool)
        .await
        .map_err(state_err)?;

        Ok(row.map(|row| {
            let highest_seen: Option<i64> = row.get("highest_seen");
            let dimension: i64 = row.get("embedding_dimension");
            let last_indexed_at: i64 = row.get("last_indexed_at");
            IndexMarker {
                partition: partition.to_string(),
                indexed: row.get::<i64, _>("indexed") != 0,
                highest_seen: highest_seen.map(|h| h as u64),
                embedding_dimension: dimension as usize,
                last_indexed_at: DateTime::from_timestamp(last_indexed_at, 0)
                    .unwrap_or_else(Utc::now),
            }
        }))
    }

    async fn mark_indexed(
        &self,
        partition: &str,
        highest_seen: Option<u64>,
        embedding_dimension: usize,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO index_markers (partition, indexed, highest_seen, embedding_dimension, last_indexed_at)
            VALUES (?, 1, ?, ?, ?)
            ON CONFLICT(partition) DO UPDATE SET
                indexed = 1,
                highest_seen = CASE
                    WHEN index_markers.highest_seen IS NULL THEN excluded.highest_seen
                    WHEN excluded.highest_seen IS NULL THEN index_markers.highest_seen
                    ELSE MAX(index_markers.highest_seen, excluded.highest_seen)
                END,
                embedding_dimension = excluded.embedding_dimension,
                last_indexed_at = excluded.last_indexed_at
            "#,
        )
        .bind(partition)
        .bind(highest_seen.map(|h| h as i64))
        .bind(embedding_dimension as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(state_err)?;
        Ok(())
    }

    async fn reset(&self, partition: &str) -> Result<()> {
        sqlx::query("DELETE FROM index_markers WHERE partition = ?")
            .bind(partition)
            .execute(&self.pool)
            .await
            .map_err(state_err)?;
        Ok(())
    }

    async fn reset_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM index_markers")
            .execute(&self.pool)
            .await
            .map_err(state_err)?;
        Ok(())
    }
}

/// Process-local tracker backed by a `HashMap`.
#[derive(Default)]
pub struct InMemoryStateTracker {
    markers: RwLock<HashMap<String, IndexMarker>>,
}

impl InMemoryStateTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateTracker for InMemoryStateTracker {
    async fn marker(&self, partition: &str) -> Result<Option<IndexMarker>> {
        Ok(self.markers.read().unwrap().get(partition).cloned())
    }

    async fn mark_indexed(
        &self,
        partition: &str,
        highest_seen: Option<u64>,
        embedding_dimension: usize,
    ) -> Result<()> {
        let mut markers = self.markers.write().unwrap();
        let merged = match markers.get(partition).and_then(|m| m.highest_seen) {
            Some(existing) => Some(highest_seen.map_or(existing, |h| h.max(existing))),
            None => highest_seen,
        };
        markers.insert(
            partition.to_string(),
            IndexMarker {
                partition: partition.to_string(),
                indexed: true,
                highest_seen: merged,
                embedding_dimension,
                last_indexed_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn reset(&self, partition: &str) -> Result<()> {
        self.markers.write().unwrap().remove(partition);
        Ok(())
    }

    async fn reset_all(&self) -> Result<()> {
        self.markers.write().unwrap().clear();
        Ok(())
    }
}
