use crate::error::KernelResult;
use crate::state_engine::StateEngine;
use crate::storage::Storage;
use serde_json::Value;
use std::sync::Arc;

fn mirror_key(namespace: &str, key: &str) -> String {
    format!("{namespace}.{key}")
}

/// Write-through wrapper: Storage is the source of truth, StateEngine is a
/// best-effort cache kept in sync on the write path.
#[derive(Clone)]
pub struct StorageWithStateMirror {
    storage: Storage,
    state: Arc<StateEngine>,
}

impl StorageWithStateMirror {
    pub fn new(storage: Storage, state: Arc<StateEngine>) -> Self {
        Self { storage, state }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn state(&self) -> &Arc<StateEngine> {
        &self.state
    }

    /// `Storage.set` then `StateEngine.set`. On Storage failure, the mirror
    /// key is best-effort deleted (it should never have been populated by
    /// this call in the first place, but a previous write may have left a
    /// stale value there) and the original error is re-raised unchanged.
    pub async fn set(&self, namespace: &str, key: &str, value: Value) -> KernelResult<()> {
        match self.storage.set(namespace, key, value.clone()).await {
            Ok(()) => {
                self.state.set(&mirror_key(namespace, key), value);
                Ok(())
            }
            Err(e) => {
                self.state.delete(&mirror_key(namespace, key));
                Err(e)
            }
        }
    }

    pub async fn get(&self, namespace: &str, key: &str) -> KernelResult<Option<Value>> {
        self.storage.get(namespace, key).await
    }

    pub async fn delete(&self, namespace: &str, key: &str) -> KernelResult<()> {
        self.storage.delete(namespace, key).await?;
        self.state.delete(&mirror_key(namespace, key));
        Ok(())
    }

    pub async fn list_keys(&self, namespace: &str) -> KernelResult<Vec<String>> {
        self.storage.list_keys(namespace).await
    }

    /// Clears Storage only. The state mirror is a hint, not a full shadow —
    /// stale mirror entries are acceptable and age out by other means.
    pub async fn clear_namespace(&self, namespace: &str) -> KernelResult<()> {
        self.storage.clear_namespace(namespace).await
    }

    pub async fn close(&self) -> KernelResult<()> {
        self.storage.close().await
    }
}
