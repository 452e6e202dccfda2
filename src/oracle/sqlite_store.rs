//! SQLite implementation of [`DurableStore`].
//!
//! Keeps the memory snapshot in a single-row table so the store can share a
//! database file with other operational data.

use crate::oracle::storage::DurableStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Pool, Sqlite};
use tracing::{debug, info};

#[derive(FromRow)]
struct SnapshotRow {
    payload: Vec<u8>,
}

/// SQLite-backed snapshot store.
pub struct SqliteSnapshotStore {
    pool: Pool<Sqlite>,
}

impl SqliteSnapshotStore {
    /// Connects to `database_url` (e.g. `sqlite:./titan.db?mode=rwc`) and creates the table.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::from_pool(pool).await
    }

    /// Wraps an existing pool, creating the snapshot table if needed.
    pub async fn from_pool(pool: Pool<Sqlite>) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memory_snapshot (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                payload BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create memory_snapshot table")?;

        info!("SQLite snapshot store ready");
        Ok(Self { pool })
    }

    pub fn get_db_pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl DurableStore for SqliteSnapshotStore {
    async fn read_all(&self) -> Result<Option<Vec<u8>>> {
        let row: Option<SnapshotRow> =
            sqlx::query_as("SELECT payload FROM memory_snapshot WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .context("Failed to read memory snapshot")?;

        Ok(row.map(|r| r.payload))
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO memory_snapshot (id, payload, updated_at)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at
            "#,
        )
        .bind(bytes)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to write memory snapshot")?;

        debug!("Persisted {} byte snapshot to SQLite", bytes.len());
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let result: (i64,) = sqlx::query_as("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("SQLite health check failed")?;
        Ok(result.0 == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_store_roundtrip() {
        let store = SqliteSnapshotStore::connect("sqlite::memory:").await.unwrap();

        assert!(store.read_all().await.unwrap().is_none());
        store.write_all(b"first").await.unwrap();
        store.write_all(b"second").await.unwrap();

        assert_eq!(store.read_all().await.unwrap(), Some(b"second".to_vec()));
        assert!(store.health_check().await.unwrap());
    }
}
