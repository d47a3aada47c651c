use super::revocation::{self, CredentialType};
use kernel_core::error::KernelResult;
use kernel_core::request_context::{CredentialSource, RequestContext};
use kernel_core::storage_mirror::StorageWithStateMirror;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const NAMESPACE: &str = "auth_sessions";
pub const USERS_NAMESPACE: &str = "auth_users";
const LAST_USED_REFRESH_THROTTLE_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub last_used: chrono::DateTime<chrono::Utc>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub scopes: HashSet<String>,
    pub is_admin: bool,
    pub password_hash: Option<String>,
    pub password_set_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn validate(storage: &StorageWithStateMirror, session_id: &str) -> KernelResult<Option<RequestContext>> {
    if revocation::is_revoked(storage, session_id).await? {
        return Ok(None);
    }

    let Some(raw) = storage.get(NAMESPACE, session_id).await? else {
        return Ok(None);
    };
    let Ok(record) = serde_json::from_value::<SessionRecord>(raw) else {
        return Ok(None);
    };

    if record.expires_at < chrono::Utc::now() {
        let _ = storage.delete(NAMESPACE, session_id).await;
        revocation::revoke(storage, session_id, CredentialType::Session).await?;
        return Ok(None);
    }

    let Some(user_raw) = storage.get(USERS_NAMESPACE, &record.user_id).await? else {
        // Dangling session: the linked user no longer exists.
        let _ = storage.delete(NAMESPACE, session_id).await;
        return Ok(None);
    };
    let Ok(user) = serde_json::from_value::<UserRecord>(user_raw) else {
        return Ok(None);
    };

    maybe_refresh_last_used(storage, session_id, &record).await;

    Ok(Some(RequestContext {
        subject: user.username,
        scopes: user.scopes,
        is_admin: user.is_admin,
        source: CredentialSource::Session,
        user_id: Some(record.user_id),
        session_id: Some(session_id.to_string()),
    }))
}

async fn maybe_refresh_last_used(storage: &StorageWithStateMirror, session_id: &str, record: &SessionRecord) {
    let now = chrono::Utc::now();
    if (now - record.last_used).num_seconds() < LAST_USED_REFRESH_THROTTLE_SECS {
        return;
    }
    let mut updated = record.clone();
    updated.last_used = now;
    if let Ok(value) = serde_json::to_value(updated) {
        if let Err(e) = storage.set(NAMESPACE, session_id, value).await {
            tracing::warn!(error = %e, "failed to refresh session last_used");
        }
    }
}

/// Revokes every session belonging to `user_id`. Used after a password
/// change, per the policy that changing a password invalidates every
/// existing session for that account.
pub async fn revoke_all_for_user(storage: &StorageWithStateMirror, user_id: &str) -> KernelResult<()> {
    for session_id in storage.list_keys(NAMESPACE).await? {
        if let Some(raw) = storage.get(NAMESPACE, &session_id).await? {
            if let Ok(record) = serde_json::from_value::<SessionRecord>(raw) {
                if record.user_id == user_id {
                    let _ = storage.delete(NAMESPACE, &session_id).await;
                    revocation::revoke(storage, &session_id, CredentialType::Session).await?;
                }
            }
        }
    }
    Ok(())
}
