use async_trait::async_trait;
use kernel_core::error::{KernelError, KernelResult};
use kernel_core::storage::StorageAdapter;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

/// Networked `StorageAdapter` backed by Postgres, used when
/// `storage.backend = "postgres"`. Values are stored as `jsonb` so the
/// primary-key-only access pattern the spec requires (no schema, no
/// foreign keys, no secondary indices) maps directly onto one table.
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    pub async fn connect(dsn: &str) -> KernelResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(dsn)
            .await
            .map_err(|e| KernelError::AdapterError(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_store (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value JSONB NOT NULL,
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
impl StorageAdapter for PostgresAdapter {
    async fn get(&self, namespace: &str, key: &str) -> KernelResult<Option<Value>> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE namespace = $1 AND key = $2")
            .bind(namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| KernelError::AdapterError(e.to_string()))?;

        match row {
            Some(row) => {
                let value: Value = row.try_get("value").map_err(|e| KernelError::AdapterError(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> KernelResult<()> {
        sqlx::query(
            "INSERT INTO kv_store (namespace, key, value) VALUES ($1, $2, $3)
             ON CONFLICT (namespace, key) DO UPDATE SET value = excluded.value",
        )
        .bind(namespace)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| KernelError::AdapterError(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> KernelResult<()> {
        sqlx::query("DELETE FROM kv_store WHERE namespace = $1 AND key = $2")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| KernelError::AdapterError(e.to_string()))?;
        Ok(())
    }

    async fn list_keys(&self, namespace: &str) -> KernelResult<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM kv_store WHERE namespace = $1")
            .bind(namespace)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| KernelError::AdapterError(e.to_string()))?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("key").map_err(|e| KernelError::AdapterError(e.to_string())))
            .collect()
    }

    async fn clear_namespace(&self, namespace: &str) -> KernelResult<()> {
        sqlx::query("DELETE FROM kv_store WHERE namespace = $1")
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
            sqlx::query(
                "INSERT INTO kv_store (namespace, key, value) VALUES ($1, $2, $3)
                 ON CONFLICT (namespace, key) DO UPDATE SET value = excluded.value",
            )
            .bind(namespace)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(|e| KernelError::AdapterError(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| KernelError::AdapterError(e.to_string()))?;
        Ok(())
    }
}
