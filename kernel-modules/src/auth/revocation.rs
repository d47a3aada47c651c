use kernel_core::error::KernelResult;
use kernel_core::storage_mirror::StorageWithStateMirror;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

pub const NAMESPACE: &str = "auth_revoked";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    ApiKey,
    Session,
    RefreshToken,
}

pub fn digest(id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hex::encode(hasher.finalize())
}

/// One shared revocation table for every credential kind. Revoking writes
/// the record here; callers are responsible for best-effort deleting the
/// credential from its own live table.
pub async fn revoke(storage: &StorageWithStateMirror, id: &str, kind: CredentialType) -> KernelResult<()> {
    let key = digest(id);
    storage
        .set(NAMESPACE, &key, json!({ "revoked_at": chrono::Utc::now(), "type": kind }))
        .await
}

pub async fn is_revoked(storage: &StorageWithStateMirror, id: &str) -> KernelResult<bool> {
    Ok(storage.get(NAMESPACE, &digest(id)).await?.is_some())
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_core::state_engine::StateEngine;
    use kernel_core::storage::Storage;
    use kernel_store::InMemoryAdapter;
    use std::sync::Arc;

    fn storage() -> StorageWithStateMirror {
        StorageWithStateMirror::new(Storage::new(Arc::new(InMemoryAdapter::new())), StateEngine::new())
    }

    #[tokio::test]
    async fn revoked_credential_is_reported_revoked() {
        let s = storage();
        assert!(!is_revoked(&s, "key-1").await.unwrap());
        revoke(&s, "key-1", CredentialType::ApiKey).await.unwrap();
        assert!(is_revoked(&s, "key-1").await.unwrap());
    }

    #[test]
    fn digest_is_deterministic_and_not_the_raw_id() {
        assert_eq!(digest("abc"), digest("abc"));
        assert_ne!(digest("abc"), "abc");
    }
}
