//! SQLite-backed [`VectorStore`] implementation.
//!
//! Vectors are stored as little-endian `f32` blobs in the `items` table and
//! searched by brute-force cosine similarity within one partition. The
//! collection's dimension lives in `collection_meta`. Tables are created by
//! [`crate::migrate::create_schema`].

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::Result;
use crate::models::{IndexedItem, ItemLevel, SearchHit};

use super::{rank_hits, VectorStore};

/// SQLite implementation of the [`VectorStore`] trait.
pub struct SqliteVectorStore {
    pool: SqlitePool,
    collection: String,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool, collection: String) -> Self {
        Self { pool, collection }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn backend_name(&self) -> &str {
        "sqlite"
    }

    async fn ensure_collection(&self, dimension: usize, recreate: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        if recreate {
            sqlx::query("DELETE FROM items WHERE collection = ?")
                .bind(&self.collection)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM collection_meta WHERE collection = ?")
                .bind(&self.collection)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO collection_meta (collection, dimension, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(collection) DO NOTHING
            "#,
        )
        .bind(&self.collection)
        .bind(dimension as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn upsert(&self, items: &[IndexedItem]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for item in items {
            let blob = vec_to_blob(&item.vector);
            sqlx::query(
                r#"
                INSERT INTO items (collection, partition, external_id, level, issue_id,
                                   ordinal, reference, url, title, author, created_at,
                                   text, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, partition, external_id, level) DO UPDATE SET
                    issue_id = excluded.issue_id,
                    ordinal = excluded.ordinal,
                    reference = excluded.reference,
                    url = excluded.url,
                    title = excluded.title,
                    author = excluded.author,
                    created_at = excluded.created_at,
                    text = excluded.text,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&self.collection)
            .bind(&item.partition)
            .bind(item.external_id())
            .bind(item.level.as_str())
            .bind(item.issue_id as i64)
            .bind(item.ordinal as i64)
            .bind(&item.reference)
            .bind(&item.url)
            .bind(&item.title)
            .bind(&item.author)
            .bind(item.created_at.timestamp())
            .bind(&item.text)
            .bind(&blob)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        partition: &str,
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let rows = sqlx::query(
            r#"
            SELECT level, issue_id, ordinal, reference, url, title, author, embedding,
                   COALESCE(substr(text, 1, 240), '') AS snippet
            FROM items
            WHERE collection = ? AND partition = ?
            "#,
        )
        .bind(&self.collection)
        .bind(partition)
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let level: String = row.get("level");
            let issue_id: i64 = row.get("issue_id");
            let ordinal: i64 = row.get("ordinal");
            hits.push(SearchHit {
                reference: row.get("reference"),
                issue_id: issue_id as u64,
                level: level.parse::<ItemLevel>()?,
                ordinal: ordinal as u32,
                title: row.get("title"),
                url: row.get("url"),
                author: row.get("author"),
                score: cosine_similarity(vector, &blob_to_vec(&blob)),
                snippet: row.get("snippet"),
            });
        }

        Ok(rank_hits(hits, top_k))
    }

    async fn collection_dimension(&self) -> Result<Option<usize>> {
        let dimension: Option<i64> =
            sqlx::query_scalar("SELECT dimension FROM collection_meta WHERE collection = ?")
                .bind(&self.collection)
                .fetch_optional(&self.pool)
                .await?;
        Ok(dimension.map(|d| d as usize))
    }

    async fn delete_partition(&self, partition: &str) -> Result<()> {
        sqlx::query("DELETE FROM items WHERE collection = ? AND partition = ?")
            .bind(&self.collection)
            .bind(partition)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteVectorStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::create_schema(&pool).await.unwrap();
        SqliteVectorStore::new(pool, "test".to_string())
    }

    fn item(partition: &str, issue_id: u64, vector: Vec<f32>) -> IndexedItem {
        IndexedItem {
            partition: partition.to_string(),
            issue_id,
            level: ItemLevel::Issue,
            ordinal: 0,
            reference: format!("#{}", issue_id),
            url: None,
            title: format!("issue {}", issue_id),
            author: Some("octo".to_string()),
            created_at: Utc::now(),
            text: format!("issue {} text", issue_id),
            vector,
        }
    }

    #[tokio::test]
    async fn test_query_scoped_to_partition() {
        let store = store().await;
        store.ensure_collection(2, false).await.unwrap();
        store
            .upsert(&[
                item("issues:a/x", 1, vec![1.0, 0.0]),
                item("issues:a/x", 2, vec![0.0, 1.0]),
                item("issues:b/y", 3, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = store.query(&[1.0, 0.0], "issues:a/x", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].reference, "#1");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!(hits.iter().all(|h| h.issue_id != 3));
    }

    #[tokio::test]
    async fn test_upsert_overwrites_same_key() {
        let store = store().await;
        store.ensure_collection(2, false).await.unwrap();
        store
            .upsert(&[item("issues:a/x", 1, vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .upsert(&[item("issues:a/x", 1, vec![0.0, 1.0])])
            .await
            .unwrap();

        let hits = store.query(&[0.0, 1.0], "issues:a/x", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_dimension_and_recreate() {
        let store = store().await;
        assert_eq!(store.collection_dimension().await.unwrap(), None);
        store.ensure_collection(2, false).await.unwrap();
        store
            .upsert(&[item("issues:a/x", 1, vec![1.0, 0.0])])
            .await
            .unwrap();
        // Without recreate the existing dimension is kept.
        store.ensure_collection(3, false).await.unwrap();
        assert_eq!(store.collection_dimension().await.unwrap(), Some(2));

        store.ensure_collection(3, true).await.unwrap();
        assert_eq!(store.collection_dimension().await.unwrap(), Some(3));
        let hits = store.query(&[1.0, 0.0, 0.0], "issues:a/x", 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_delete_partition() {
        let store = store().await;
        store.ensure_collection(2, false).await.unwrap();
        store
            .upsert(&[
                item("issues:a/x", 1, vec![1.0, 0.0]),
                item("issues:b/y", 2, vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        store.delete_partition("issues:a/x").await.unwrap();
        assert!(store.query(&[1.0, 0.0], "issues:a/x", 5).await.unwrap().is_empty());
        assert_eq!(store.query(&[1.0, 0.0], "issues:b/y", 5).await.unwrap().len(), 1);
    }
}
