use async_trait::async_trait;
use dashmap::DashMap;
use kernel_core::error::KernelResult;
use kernel_core::storage::StorageAdapter;
use serde_json::Value;
use std::collections::HashSet;

/// Default, test-friendly [`StorageAdapter`]: a concurrent in-process map.
/// No persistence across restarts; used when `storage.backend = "memory"`.
#[derive(Default)]
pub struct InMemoryAdapter {
    data: DashMap<(String, String), Value>,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for InMemoryAdapter {
    async fn get(&self, namespace: &str, key: &str) -> KernelResult<Option<Value>> {
        Ok(self
            .data
            .get(&(namespace.to_string(), key.to_string()))
            .map(|v| v.clone()))
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> KernelResult<()> {
        self.data.insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> KernelResult<()> {
        self.data.remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    async fn list_keys(&self, namespace: &str) -> KernelResult<Vec<String>> {
        let keys: HashSet<String> = self
            .data
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .map(|entry| entry.key().1.clone())
            .collect();
        Ok(keys.into_iter().collect())
    }

    async fn clear_namespace(&self, namespace: &str) -> KernelResult<()> {
        self.data.retain(|k, _| k.0 != namespace);
        Ok(())
    }

    async fn close(&self) -> KernelResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_keys_scoped_to_namespace() {
        let adapter = InMemoryAdapter::new();
        adapter.set("a", "k1", serde_json::json!({})).await.unwrap();
        adapter.set("b", "k2", serde_json::json!({})).await.unwrap();
        let keys = adapter.list_keys("a").await.unwrap();
        assert_eq!(keys, vec!["k1".to_string()]);
    }

    #[tokio::test]
    async fn clear_namespace_only_affects_that_namespace() {
        let adapter = InMemoryAdapter::new();
        adapter.set("a", "k1", serde_json::json!({})).await.unwrap();
        adapter.set("b", "k2", serde_json::json!({})).await.unwrap();
        adapter.clear_namespace("a").await.unwrap();
        assert!(adapter.get("a", "k1").await.unwrap().is_none());
        assert!(adapter.get("b", "k2").await.unwrap().is_some());
    }
}
