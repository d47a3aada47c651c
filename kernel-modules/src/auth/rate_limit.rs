use kernel_core::error::{KernelError, KernelResult};
use kernel_core::storage_mirror::StorageWithStateMirror;
use serde::{Deserialize, Serialize};
use serde_json::{from_value, json};

pub const NAMESPACE: &str = "auth_rate_limits";

#[derive(Debug, Clone, Copy)]
pub enum Bucket {
    /// Unauthenticated requests against `/admin/auth/*` and every
    /// authentication attempt. Strict: ~10 per 60s.
    Auth,
    /// Authenticated requests. Loose: ~1000 per 60s.
    Api,
}

impl Bucket {
    fn name(self) -> &'static str {
        match self {
            Bucket::Auth => "auth",
            Bucket::Api => "api",
        }
    }

    fn limit(self) -> u64 {
        match self {
            Bucket::Auth => 10,
            Bucket::Api => 1000,
        }
    }
}

const WINDOW_SECS: i64 = 60;

#[derive(Debug, Serialize, Deserialize)]
struct Window {
    count: u64,
    window_start: i64,
    last_attempt: i64,
}

/// Returned by a denied check so callers can set `Retry-After` and
/// `X-RateLimit-*` response headers.
#[derive(Debug)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub remaining: u64,
    pub retry_after_secs: u64,
}

/// Checks and increments the bucket for `identifier`. Fails open on
/// storage errors: denying all traffic on storage trouble is worse than
/// temporarily over-serving.
pub async fn check(storage: &StorageWithStateMirror, bucket: Bucket, identifier: &str) -> KernelResult<RateLimitStatus> {
    let key = super::revocation::digest(&format!("{}:{}", bucket.name(), identifier));
    let now = chrono::Utc::now().timestamp();

    let existing = match storage.get(NAMESPACE, &key).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "rate limit storage read failed, failing open");
            return Ok(RateLimitStatus { limit: bucket.limit(), remaining: bucket.limit(), retry_after_secs: 0 });
        }
    };

    let window: Option<Window> = existing.and_then(|v| from_value(v).ok());
    let limit = bucket.limit();

    let next = match window {
        Some(w) if now - w.window_start < WINDOW_SECS => {
            if w.count >= limit {
                let retry_after = (w.window_start + WINDOW_SECS - now).max(0) as u64;
                return Err(KernelError::RateLimited { retry_after_secs: retry_after });
            }
            Window { count: w.count + 1, window_start: w.window_start, last_attempt: now }
        }
        _ => Window { count: 1, window_start: now, last_attempt: now },
    };

    let remaining = limit.saturating_sub(next.count);
    if let Err(e) = storage
        .set(NAMESPACE, &key, json!({ "count": next.count, "window_start": next.window_start, "last_attempt": next.last_attempt }))
        .await
    {
        tracing::warn!(error = %e, "rate limit storage write failed, failing open for this attempt");
    }

    Ok(RateLimitStatus { limit, remaining, retry_after_secs: 0 })
}
