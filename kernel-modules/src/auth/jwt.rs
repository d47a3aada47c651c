use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use kernel_core::error::KernelResult;
use kernel_core::storage_mirror::StorageWithStateMirror;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;

const CONFIG_NAMESPACE: &str = "auth_config";
const SECRET_KEY: &str = "jwt_secret_key";
const ACCESS_TOKEN_LIFETIME_SECS: i64 = 15 * 60;
const MIN_SECRET_BYTES: usize = 32;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub user_id: String,
    pub scopes: Vec<String>,
    pub is_admin: bool,
    pub exp: i64,
    #[serde(rename = "type")]
    pub token_type: String,
}

/// Caches the HMAC secret in memory to resist racing concurrent callers
/// from generating two different secrets on first use; the durable copy
/// lives in `auth_config["jwt_secret_key"]`.
pub struct JwtSecretCache {
    cached: Mutex<Option<String>>,
}

impl Default for JwtSecretCache {
    fn default() -> Self {
        Self { cached: Mutex::new(None) }
    }
}

impl JwtSecretCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_generate(&self, storage: &StorageWithStateMirror) -> KernelResult<String> {
        if let Some(secret) = self.cached.lock().unwrap().clone() {
            return Ok(secret);
        }

        if let Some(existing) = storage.get(CONFIG_NAMESPACE, SECRET_KEY).await? {
            if let Some(value) = existing.get("value").and_then(|v| v.as_str()) {
                *self.cached.lock().unwrap() = Some(value.to_string());
                return Ok(value.to_string());
            }
        }

        let generated = generate_secret();
        storage.set(CONFIG_NAMESPACE, SECRET_KEY, serde_json::json!({ "value": generated })).await?;
        *self.cached.lock().unwrap() = Some(generated.clone());
        Ok(generated)
    }
}

fn generate_secret() -> String {
    let mut bytes = Vec::with_capacity(MIN_SECRET_BYTES);
    while bytes.len() < MIN_SECRET_BYTES {
        bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    }
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn issue_access_token(secret: &str, user_id: &str, scopes: &HashSet<String>, is_admin: bool) -> KernelResult<String> {
    let claims = Claims {
        user_id: user_id.to_string(),
        scopes: scopes.iter().cloned().collect(),
        is_admin,
        exp: chrono::Utc::now().timestamp() + ACCESS_TOKEN_LIFETIME_SECS,
        token_type: "access".to_string(),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| kernel_core::error::KernelError::Internal(e.into()))
}

/// Any decode or signature failure returns `None` silently — there is no
/// side channel for why a JWT was rejected.
pub fn decode_access_token(secret: &str, token: &str) -> Option<Claims> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation).ok()?;
    if data.claims.token_type != "access" {
        return None;
    }
    Some(data.claims)
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
    async fn secret_is_generated_once_and_persisted() {
        let s = storage();
        let cache = JwtSecretCache::new();
        let secret1 = cache.get_or_generate(&s).await.unwrap();
        let secret2 = cache.get_or_generate(&s).await.unwrap();
        assert_eq!(secret1, secret2);
        assert!(secret1.len() >= 32);
    }

    #[test]
    fn issue_then_decode_round_trips() {
        let scopes: HashSet<String> = ["devices.read".to_string()].into_iter().collect();
        let token = issue_access_token("s3cr3t", "u1", &scopes, false).unwrap();
        let claims = decode_access_token("s3cr3t", &token).unwrap();
        assert_eq!(claims.user_id, "u1");
        assert!(!claims.is_admin);
    }

    #[test]
    fn wrong_secret_is_rejected_silently() {
        let scopes = HashSet::new();
        let token = issue_access_token("s3cr3t", "u1", &scopes, false).unwrap();
        assert!(decode_access_token("wrong", &token).is_none());
    }

    #[test]
    fn token_without_three_segments_is_rejected() {
        assert!(decode_access_token("s3cr3t", "not-a-jwt").is_none());
    }
}
