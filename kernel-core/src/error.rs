use serde_json::{json, Value};

/// Unified error taxonomy for the kernel and everything built on top of it.
///
/// Every variant maps to exactly one HTTP status via [`KernelError::status_code`];
/// the HTTP gateway is the only layer allowed to perform that translation.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("timeout")]
    Timeout,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("missing dependency: {0}")]
    DependencyMissing(String),

    #[error("storage adapter error: {0}")]
    AdapterError(String),

    #[error("plugin lifecycle error in {plugin}: {source}")]
    PluginLifecycleError {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl KernelError {
    pub fn status_code(&self) -> u16 {
        match self {
            KernelError::InvalidInput(_) => 400,
            KernelError::NotFound(_) => 404,
            KernelError::Unauthenticated => 401,
            KernelError::Unauthorized => 403,
            KernelError::RateLimited { .. } => 429,
            KernelError::Timeout => 504,
            KernelError::Conflict(_) => 409,
            KernelError::DependencyMissing(_) => 400,
            KernelError::AdapterError(_) => 500,
            KernelError::PluginLifecycleError { .. } => 500,
            KernelError::ConfigError(_) => 500,
            KernelError::Io(_) => 500,
            KernelError::Serde(_) => 500,
            KernelError::Internal(_) => 500,
        }
    }

    pub fn to_json_body(&self) -> Value {
        json!({
            "error": self.to_string(),
            "status": self.status_code(),
        })
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            KernelError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(KernelError::InvalidInput("x".into()).status_code(), 400);
        assert_eq!(KernelError::NotFound("x".into()).status_code(), 404);
        assert_eq!(KernelError::Unauthenticated.status_code(), 401);
        assert_eq!(KernelError::Unauthorized.status_code(), 403);
        assert_eq!(
            KernelError::RateLimited { retry_after_secs: 60 }.status_code(),
            429
        );
        assert_eq!(KernelError::Timeout.status_code(), 504);
        assert_eq!(KernelError::Conflict("x".into()).status_code(), 409);
    }

    #[test]
    fn json_body_contains_status_and_message() {
        let err = KernelError::NotFound("service foo".into());
        let body = err.to_json_body();
        assert_eq!(body["status"], 404);
        assert!(body["error"].as_str().unwrap().contains("foo"));
    }

    #[test]
    fn rate_limited_exposes_retry_after() {
        let err = KernelError::RateLimited { retry_after_secs: 42 };
        assert_eq!(err.retry_after_secs(), Some(42));
        assert_eq!(KernelError::Timeout.retry_after_secs(), None);
    }
}
