pub mod api_keys;
pub mod audit;
pub mod jwt;
pub mod passwords;
pub mod rate_limit;
pub mod revocation;
pub mod sessions;

use async_trait::async_trait;
use kernel_core::error::{KernelError, KernelResult};
use kernel_core::plugin::{Plugin, PluginMetadata, RuntimeHandle};
use kernel_core::request_context::RequestContext;
use kernel_core::storage_mirror::StorageWithStateMirror;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub const REFRESH_TOKENS_NAMESPACE: &str = "auth_refresh_tokens";
const REFRESH_TOKEN_LIFETIME_SECS: i64 = 7 * 24 * 60 * 60;

/// Raw credential material lifted off one HTTP request, before it has
/// been checked against anything.
pub enum RawCredential<'a> {
    Bearer(&'a str),
    SessionCookie(&'a str),
}

/// Splits a bearer token into a JWT vs. an opaque API key the way the
/// boundary's credential-acquisition step does: three dot-separated
/// base64url segments means JWT, anything else means API key.
pub fn classify_bearer(token: &str) -> bool {
    token.split('.').count() == 3
}

/// The single most complex subsystem: credential acquisition,
/// validation, rate limiting, revocation, and audit, all running as
/// HTTP middleware ahead of any plugin or service code.
pub struct AuthBoundary {
    storage: StorageWithStateMirror,
    jwt_secret: jwt::JwtSecretCache,
}

impl AuthBoundary {
    pub fn new(storage: StorageWithStateMirror) -> Self {
        Self { storage, jwt_secret: jwt::JwtSecretCache::new() }
    }

    /// Loads (or generates and persists) the JWT signing secret ahead of
    /// the first request, so a cold cache never adds latency to the
    /// first login.
    pub async fn warm_jwt_secret(&self) -> KernelResult<()> {
        self.jwt_secret.get_or_generate(&self.storage).await.map(|_| ())
    }

    /// Resolves one of the three credential kinds into a `RequestContext`,
    /// or `None` if no credential was presented or none validated.
    pub async fn authenticate(&self, credential: Option<RawCredential<'_>>) -> KernelResult<Option<RequestContext>> {
        let ctx = match credential {
            Some(RawCredential::Bearer(token)) if classify_bearer(token) => self.validate_jwt(token).await?,
            Some(RawCredential::Bearer(key)) => self.validate_api_key(key).await?,
            Some(RawCredential::SessionCookie(session_id)) => self.validate_session(session_id).await?,
            None => None,
        };
        Ok(ctx)
    }

    async fn validate_jwt(&self, token: &str) -> KernelResult<Option<RequestContext>> {
        let secret = self.jwt_secret.get_or_generate(&self.storage).await?;
        let Some(claims) = jwt::decode_access_token(&secret, token) else {
            return Ok(None);
        };
        Ok(Some(RequestContext {
            subject: claims.user_id.clone(),
            scopes: claims.scopes.into_iter().collect(),
            is_admin: claims.is_admin,
            source: kernel_core::request_context::CredentialSource::Jwt,
            user_id: Some(claims.user_id),
            session_id: None,
        }))
    }

    async fn validate_api_key(&self, key: &str) -> KernelResult<Option<RequestContext>> {
        api_keys::validate(&self.storage, key).await
    }

    async fn validate_session(&self, session_id: &str) -> KernelResult<Option<RequestContext>> {
        sessions::validate(&self.storage, session_id).await
    }

    pub async fn check_rate_limit(&self, bucket: rate_limit::Bucket, identifier: &str) -> KernelResult<()> {
        rate_limit::check(&self.storage, bucket, identifier).await.map(|_| ())
    }

    pub async fn audit(&self, event_type: &str, subject: &str, success: bool, details: Value) {
        audit::record(&self.storage, event_type, subject, success, details).await
    }

    /// Verifies a username/password pair, on success returns a fresh
    /// access token plus a fresh refresh token.
    pub async fn login(&self, user_id: &str, password: &str) -> KernelResult<(String, String)> {
        let Some(raw) = self.storage.get(sessions::USERS_NAMESPACE, user_id).await? else {
            self.audit("auth.login", user_id, false, json!({"reason": "unknown_user"})).await;
            return Err(KernelError::Unauthenticated);
        };
        let user: sessions::UserRecord = serde_json::from_value(raw)?;
        let Some(hash) = &user.password_hash else {
            self.audit("auth.login", user_id, false, json!({"reason": "no_password_set"})).await;
            return Err(KernelError::Unauthenticated);
        };
        if !passwords::verify(password, hash).await? {
            self.audit("auth.login", user_id, false, json!({"reason": "bad_password"})).await;
            return Err(KernelError::Unauthenticated);
        }

        let secret = self.jwt_secret.get_or_generate(&self.storage).await?;
        let access = jwt::issue_access_token(&secret, user_id, &user.scopes, user.is_admin)?;
        let refresh = self.issue_refresh_token(user_id).await?;
        self.audit("auth.login", user_id, true, json!({})).await;
        Ok((access, refresh))
    }

    async fn issue_refresh_token(&self, user_id: &str) -> KernelResult<String> {
        let token = generate_opaque_token();
        let now = chrono::Utc::now();
        let record = json!({
            "user_id": user_id,
            "created_at": now,
            "expires_at": now + chrono::Duration::seconds(REFRESH_TOKEN_LIFETIME_SECS),
            "last_used": now,
            "client_ip": Value::Null,
            "user_agent": Value::Null,
        });
        self.storage.set(REFRESH_TOKENS_NAMESPACE, &token, record).await?;
        Ok(token)
    }

    /// Validates `refresh_token` twice around the user fetch (closing the
    /// window where a token is revoked mid-refresh), issues a new access
    /// token, and rotates the refresh token — the old one is revoked only
    /// after the new one has been durably persisted.
    pub async fn refresh(&self, refresh_token: &str) -> KernelResult<(String, String)> {
        if revocation::is_revoked(&self.storage, refresh_token).await? {
            return Err(KernelError::Unauthenticated);
        }
        let Some(raw) = self.storage.get(REFRESH_TOKENS_NAMESPACE, refresh_token).await? else {
            return Err(KernelError::Unauthenticated);
        };
        let user_id = raw.get("user_id").and_then(|v| v.as_str()).ok_or(KernelError::Unauthenticated)?.to_string();
        let expires_at = raw
            .get("expires_at")
            .and_then(|v| serde_json::from_value::<chrono::DateTime<chrono::Utc>>(v.clone()).ok())
            .ok_or(KernelError::Unauthenticated)?;
        if expires_at < chrono::Utc::now() {
            return Err(KernelError::Unauthenticated);
        }
        if revocation::is_revoked(&self.storage, refresh_token).await? {
            return Err(KernelError::Unauthenticated);
        }

        let Some(user_raw) = self.storage.get(sessions::USERS_NAMESPACE, &user_id).await? else {
            return Err(KernelError::Unauthenticated);
        };
        let user: sessions::UserRecord = serde_json::from_value(user_raw)?;

        let secret = self.jwt_secret.get_or_generate(&self.storage).await?;
        let access = jwt::issue_access_token(&secret, &user_id, &user.scopes, user.is_admin)?;
        let new_refresh = self.issue_refresh_token(&user_id).await?;
        revocation::revoke(&self.storage, refresh_token, revocation::CredentialType::RefreshToken).await?;
        let _ = self.storage.delete(REFRESH_TOKENS_NAMESPACE, refresh_token).await;

        self.audit("auth.refresh", &user_id, true, json!({})).await;
        Ok((access, new_refresh))
    }

    pub async fn logout(&self, session_id: &str) -> KernelResult<()> {
        let _ = self.storage.delete(sessions::NAMESPACE, session_id).await;
        revocation::revoke(&self.storage, session_id, revocation::CredentialType::Session).await?;
        self.audit("auth.logout", session_id, true, json!({})).await;
        Ok(())
    }

    pub async fn set_password(&self, user_id: &str, password: &str) -> KernelResult<()> {
        let hashed = passwords::hash(password).await?;
        let Some(raw) = self.storage.get(sessions::USERS_NAMESPACE, user_id).await? else {
            return Err(KernelError::NotFound(format!("user {user_id}")));
        };
        let mut user: sessions::UserRecord = serde_json::from_value(raw)?;
        user.password_hash = Some(hashed);
        user.password_set_at = Some(chrono::Utc::now());
        self.storage.set(sessions::USERS_NAMESPACE, user_id, serde_json::to_value(user)?).await
    }

    /// Verifies the old password, rejects a new password identical to the
    /// old one, hashes and stores the new password, then revokes every
    /// session belonging to the account.
    pub async fn change_password(&self, user_id: &str, old_password: &str, new_password: &str) -> KernelResult<()> {
        if old_password == new_password {
            return Err(KernelError::InvalidInput("new password must differ from the old one".into()));
        }
        let Some(raw) = self.storage.get(sessions::USERS_NAMESPACE, user_id).await? else {
            return Err(KernelError::NotFound(format!("user {user_id}")));
        };
        let user: sessions::UserRecord = serde_json::from_value(raw)?;
        let Some(hash) = &user.password_hash else {
            return Err(KernelError::Unauthenticated);
        };
        if !passwords::verify(old_password, hash).await? {
            self.audit("auth.change_password", user_id, false, json!({"reason": "bad_old_password"})).await;
            return Err(KernelError::Unauthenticated);
        }
        self.set_password(user_id, new_password).await?;
        sessions::revoke_all_for_user(&self.storage, user_id).await?;
        self.audit("auth.change_password", user_id, true, json!({})).await;
        Ok(())
    }
}

fn generate_opaque_token() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    let mut bytes = Vec::with_capacity(32);
    while bytes.len() < 32 {
        bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    }
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Exposes the auth boundary's mutating flows as named services and
/// `/admin/auth/*` HTTP contracts, and runs rate limiting against its own
/// `auth` bucket for every call it makes on behalf of an unauthenticated
/// caller.
pub struct AuthModule {
    boundary: Arc<AuthBoundary>,
}

impl AuthModule {
    pub fn new(boundary: Arc<AuthBoundary>) -> Self {
        Self { boundary }
    }
}

struct LoginService(Arc<AuthBoundary>);
#[async_trait]
impl kernel_core::service_registry::ServiceHandler for LoginService {
    async fn call(&self, args: Vec<Value>, _kwargs: HashMap<String, Value>) -> KernelResult<Value> {
        let user_id = args.first().and_then(|v| v.as_str()).ok_or_else(|| KernelError::InvalidInput("user_id required".into()))?;
        let password = args.get(1).and_then(|v| v.as_str()).ok_or_else(|| KernelError::InvalidInput("password required".into()))?;
        self.0.check_rate_limit(rate_limit::Bucket::Auth, user_id).await?;
        let (access, refresh) = self.0.login(user_id, password).await?;
        Ok(json!({ "access_token": access, "refresh_token": refresh }))
    }
}

struct RefreshService(Arc<AuthBoundary>);
#[async_trait]
impl kernel_core::service_registry::ServiceHandler for RefreshService {
    async fn call(&self, args: Vec<Value>, _kwargs: HashMap<String, Value>) -> KernelResult<Value> {
        let token = args.first().and_then(|v| v.as_str()).ok_or_else(|| KernelError::InvalidInput("refresh_token required".into()))?;
        let (access, refresh) = self.0.refresh(token).await?;
        Ok(json!({ "access_token": access, "refresh_token": refresh }))
    }
}

struct LogoutService(Arc<AuthBoundary>);
#[async_trait]
impl kernel_core::service_registry::ServiceHandler for LogoutService {
    async fn call(&self, args: Vec<Value>, _kwargs: HashMap<String, Value>) -> KernelResult<Value> {
        let session_id = args.first().and_then(|v| v.as_str()).ok_or_else(|| KernelError::InvalidInput("session_id required".into()))?;
        self.0.logout(session_id).await?;
        Ok(json!({ "ok": true }))
    }
}

struct ChangePasswordService(Arc<AuthBoundary>);
#[async_trait]
impl kernel_core::service_registry::ServiceHandler for ChangePasswordService {
    async fn call(&self, args: Vec<Value>, _kwargs: HashMap<String, Value>) -> KernelResult<Value> {
        let user_id = args.first().and_then(|v| v.as_str()).ok_or_else(|| KernelError::InvalidInput("user_id required".into()))?;
        let old = args.get(1).and_then(|v| v.as_str()).ok_or_else(|| KernelError::InvalidInput("old_password required".into()))?;
        let new = args.get(2).and_then(|v| v.as_str()).ok_or_else(|| KernelError::InvalidInput("new_password required".into()))?;
        self.0.change_password(user_id, old, new).await?;
        Ok(json!({ "ok": true }))
    }
}

#[async_trait]
impl Plugin for AuthModule {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            name: "auth".into(),
            version: "1.0.0".into(),
            description: "Authentication boundary: login, refresh, logout, password management".into(),
            author: "runtime-kernel".into(),
            dependencies: vec![],
        }
    }

    async fn on_load(&self, runtime: Arc<RuntimeHandle>) -> anyhow::Result<()> {
        let services = &runtime.service_registry;
        services.register("auth.login", Arc::new(LoginService(Arc::clone(&self.boundary))))?;
        services.register("auth.refresh", Arc::new(RefreshService(Arc::clone(&self.boundary))))?;
        services.register("auth.logout", Arc::new(LogoutService(Arc::clone(&self.boundary))))?;
        services.register("auth.change_password", Arc::new(ChangePasswordService(Arc::clone(&self.boundary))))?;

        let http = &runtime.http_registry;
        http.register(kernel_core::http_registry::HttpMethod::Post, "/admin/auth/login", "auth.login", Some("Authenticate with username and password".into()), None)?;
        http.register(kernel_core::http_registry::HttpMethod::Post, "/admin/auth/refresh", "auth.refresh", Some("Exchange a refresh token for a new access token".into()), None)?;
        http.register(kernel_core::http_registry::HttpMethod::Post, "/admin/auth/logout", "auth.logout", Some("Invalidate a session".into()), None)?;
        http.register(kernel_core::http_registry::HttpMethod::Post, "/admin/auth/change_password", "auth.change_password", Some("Change the current user's password".into()), None)?;
        Ok(())
    }

    async fn on_unload(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_core::state_engine::StateEngine;
    use kernel_core::storage::Storage;
    use kernel_store::InMemoryAdapter;

    fn boundary() -> AuthBoundary {
        AuthBoundary::new(StorageWithStateMirror::new(Storage::new(Arc::new(InMemoryAdapter::new())), StateEngine::new()))
    }

    #[test]
    fn classify_bearer_distinguishes_jwt_from_api_key() {
        assert!(classify_bearer("a.b.c"));
        assert!(!classify_bearer("opaque-key-value"));
    }

    #[tokio::test]
    async fn login_with_wrong_password_is_rejected() {
        let b = boundary();
        let user = sessions::UserRecord {
            username: "alice".into(),
            scopes: HashSet::new(),
            is_admin: false,
            password_hash: Some(passwords::hash("Correct123").await.unwrap()),
            password_set_at: None,
        };
        b.storage.set(sessions::USERS_NAMESPACE, "u1", serde_json::to_value(user).unwrap()).await.unwrap();
        assert!(b.login("u1", "Wrong123").await.is_err());
    }

    #[tokio::test]
    async fn login_then_refresh_round_trips() {
        let b = boundary();
        let user = sessions::UserRecord {
            username: "alice".into(),
            scopes: HashSet::new(),
            is_admin: false,
            password_hash: Some(passwords::hash("Correct123").await.unwrap()),
            password_set_at: None,
        };
        b.storage.set(sessions::USERS_NAMESPACE, "u1", serde_json::to_value(user).unwrap()).await.unwrap();
        let (_access, refresh) = b.login("u1", "Correct123").await.unwrap();
        let (new_access, _new_refresh) = b.refresh(&refresh).await.unwrap();
        assert!(!new_access.is_empty());
        // old refresh token is now revoked
        assert!(b.refresh(&refresh).await.is_err());
    }

    #[tokio::test]
    async fn change_password_revokes_existing_sessions() {
        let b = boundary();
        let user = sessions::UserRecord {
            username: "alice".into(),
            scopes: HashSet::new(),
            is_admin: false,
            password_hash: Some(passwords::hash("Correct123").await.unwrap()),
            password_set_at: None,
        };
        b.storage.set(sessions::USERS_NAMESPACE, "u1", serde_json::to_value(user).unwrap()).await.unwrap();
        let session = sessions::SessionRecord {
            user_id: "u1".into(),
            created_at: chrono::Utc::now(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            last_used: chrono::Utc::now(),
            client_ip: None,
            user_agent: None,
        };
        b.storage.set(sessions::NAMESPACE, "sess-1", serde_json::to_value(session).unwrap()).await.unwrap();

        b.change_password("u1", "Correct123", "NewPass456").await.unwrap();
        assert!(sessions::validate(&b.storage, "sess-1").await.unwrap().is_none());
    }
}
