//! Database schema for the SQLite vector store and the index markers.
//!
//! All statements are idempotent, so [`create_schema`] runs on every open.
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `items` | Indexed issues and comments with their embedding blobs |
//! | `collection_meta` | Embedding dimension per collection |
//! | `index_markers` | Per-partition indexing progress |

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the database file (if needed) and every table.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::open(config).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an open pool.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            collection TEXT NOT NULL,
            partition TEXT NOT NULL,
            external_id TEXT NOT NULL,
            level TEXT NOT NULL,
            issue_id INTEGER NOT NULL,
            ordinal INTEGER NOT NULL DEFAULT 0,
            reference TEXT NOT NULL,
            url TEXT,
            title TEXT NOT NULL,
            author TEXT,
            created_at INTEGER NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (collection, partition, external_id, level)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collection_meta (
            collection TEXT PRIMARY KEY,
            dimension INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_markers (
            partition TEXT PRIMARY KEY,
            indexed INTEGER NOT NULL DEFAULT 0,
            highest_seen INTEGER,
            embedding_dimension INTEGER NOT NULL,
            last_indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_items_partition ON items(collection, partition)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
