use async_trait::async_trait;
use kernel_core::error::{KernelError, KernelResult};
use kernel_core::storage::StorageAdapter;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

/// Embedded file-backed `StorageAdapter`, used when `storage.backend =
/// "sqlite"`. Every operation runs through a pooled connection with WAL
/// journaling, standing in for the spec's "one connection per worker
/// thread" discipline — sqlx's async driver multiplexes pooled connections
/// instead of dedicating one per OS thread, but the effect (no operation
/// blocks the cooperative scheduler) is the same.
pub struct SqliteAdapter {
    pool: SqlitePool,
}

impl SqliteAdapter {
    pub async fn connect(dsn: &str) -> KernelResult<Self> {
        let options = SqliteConnectOptions::from_str(dsn)
            .map_err(|e| KernelError::AdapterError(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| KernelError::AdapterError(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_store (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| KernelError::AdapterError(e.to_string()))?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    async fn get(&self, namespace: &str, key: &str) -> KernelResult<Option<Value>> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| KernelError::AdapterError(e.to_string()))?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("value").map_err(|e| KernelError::AdapterError(e.to_string()))?;
                let value: Value = serde_json::from_str(&raw)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> KernelResult<()> {
        let raw = serde_json::to_string(&value)?;
        sqlx::query(
            "INSERT INTO kv_store (namespace, key, value) VALUES (?, ?, ?)
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value",
        )
        .bind(namespace)
        .bind(key)
        .bind(raw)
        .execute(&self.pool)
        .await
        .map_err(|e| KernelError::AdapterError(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> KernelResult<()> {
        sqlx::query("DELETE FROM kv_store WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| KernelError::AdapterError(e.to_string()))?;
        Ok(())
    }

    async fn list_keys(&self, namespace: &str) -> KernelResult<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM kv_store WHERE namespace = ?")
            .bind(namespace)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| KernelError::AdapterError(e.to_string()))?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("key").map_err(|e| KernelError::AdapterError(e.to_string())))
            .collect()
    }

    async fn clear_namespace(&self, namespace: &str) -> KernelResult<()> {
        sqlx::query("DELETE FROM kv_store WHERE namespace = ?")
            .bind(namespace)
            .execute(&self.pool)
            .await
            .map_err(|e| KernelError::AdapterError(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> KernelResult<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn batch_set(&self, items: Vec<(String, String, Value)>) -> KernelResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| KernelError::AdapterError(e.to_string()))?;
        for (namespace, key, value) in items {
            let raw = serde_json::to_string(&value)?;
            sqlx::query(
                "INSERT INTO kv_store (namespace, key, value) VALUES (?, ?, ?)
                 ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value",
            )
            .bind(namespace)
            .bind(key)
            .bind(raw)
            .execute(&mut *tx)
            .await
            .map_err(|e| KernelError::AdapterError(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| KernelError::AdapterError(e.to_string()))?;
        Ok(())
    }
}
