use crate::error::{KernelError, KernelResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Port implemented by every persistent key/value backend.
///
/// A record is a `(namespace, key) -> JSON object` triple. Implementations
/// must be safe under concurrent callers; a SQL-backed implementation is
/// expected to use a connection pool and WAL-style journaling where
/// applicable.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> KernelResult<Option<Value>>;
    async fn set(&self, namespace: &str, key: &str, value: Value) -> KernelResult<()>;
    async fn delete(&self, namespace: &str, key: &str) -> KernelResult<()>;
    async fn list_keys(&self, namespace: &str) -> KernelResult<Vec<String>>;
    async fn clear_namespace(&self, namespace: &str) -> KernelResult<()>;
    async fn close(&self) -> KernelResult<()>;

    /// Write several `(namespace, key, value)` triples as one unit where the
    /// backend supports it; a best-effort sequential fallback is acceptable.
    async fn batch_set(&self, items: Vec<(String, String, Value)>) -> KernelResult<()> {
        for (ns, key, value) in items {
            self.set(&ns, &key, value).await?;
        }
        Ok(())
    }
}

/// Validating facade over a [`StorageAdapter`].
///
/// Enforces: non-empty namespace and key; value must be a JSON object
/// (never an array or scalar). This is the only type plugins and kernel
/// modules are handed — the raw adapter is never exposed past construction.
#[derive(Clone)]
pub struct Storage {
    adapter: Arc<dyn StorageAdapter>,
}

impl Storage {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self { adapter }
    }

    fn validate_ns_key(namespace: &str, key: &str) -> KernelResult<()> {
        if namespace.is_empty() {
            return Err(KernelError::InvalidInput("namespace must be non-empty".into()));
        }
        if key.is_empty() {
            return Err(KernelError::InvalidInput("key must be non-empty".into()));
        }
        Ok(())
    }

    fn validate_value(value: &Value) -> KernelResult<()> {
        if !value.is_object() {
            return Err(KernelError::InvalidInput(
                "storage value must be a JSON object".into(),
            ));
        }
        Ok(())
    }

    pub async fn get(&self, namespace: &str, key: &str) -> KernelResult<Option<Value>> {
        Self::validate_ns_key(namespace, key)?;
        self.adapter.get(namespace, key).await
    }

    pub async fn set(&self, namespace: &str, key: &str, value: Value) -> KernelResult<()> {
        Self::validate_ns_key(namespace, key)?;
        Self::validate_value(&value)?;
        self.adapter.set(namespace, key, value).await
    }

    pub async fn delete(&self, namespace: &str, key: &str) -> KernelResult<()> {
        Self::validate_ns_key(namespace, key)?;
        self.adapter.delete(namespace, key).await
    }

    pub async fn list_keys(&self, namespace: &str) -> KernelResult<Vec<String>> {
        if namespace.is_empty() {
            return Err(KernelError::InvalidInput("namespace must be non-empty".into()));
        }
        self.adapter.list_keys(namespace).await
    }

    pub async fn clear_namespace(&self, namespace: &str) -> KernelResult<()> {
        if namespace.is_empty() {
            return Err(KernelError::InvalidInput("namespace must be non-empty".into()));
        }
        self.adapter.clear_namespace(namespace).await
    }

    pub async fn batch_set(&self, items: Vec<(String, String, Value)>) -> KernelResult<()> {
        for (ns, key, value) in &items {
            Self::validate_ns_key(ns, key)?;
            Self::validate_value(value)?;
        }
        self.adapter.batch_set(items).await
    }

    pub async fn close(&self) -> KernelResult<()> {
        self.adapter.close().await
    }

    /// Scoped transaction: runs `f` and, if it returns `Err`, nothing it did
    /// is rolled back automatically by this facade (that guarantee is the
    /// adapter's job where the backend supports transactions). This wrapper
    /// exists so callers have one place to reason about a batch of writes.
    pub async fn transaction<F, Fut, T>(&self, f: F) -> KernelResult<T>
    where
        F: FnOnce(Storage) -> Fut,
        Fut: std::future::Future<Output = KernelResult<T>>,
    {
        f(self.clone()).await
    }
}
