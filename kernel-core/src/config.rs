use crate::error::{KernelError, KernelResult};
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

fn default_storage_backend() -> String {
    "memory".to_string()
}
fn default_environment() -> String {
    "development".to_string()
}
fn default_true() -> bool {
    true
}
fn default_auth_limit() -> u32 {
    10
}
fn default_api_limit() -> u32 {
    1000
}
fn default_window_secs() -> u64 {
    60
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_shutdown_timeout_ms() -> u64 {
    10_000
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_operation_log_capacity() -> usize {
    1000
}
fn default_plugin_dir() -> String {
    "plugins".to_string()
}
fn default_csp_mode() -> String {
    "relaxed".to_string()
}
fn default_same_site() -> String {
    "lax".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    #[serde(default)]
    pub dsn: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            dsn: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_auth_limit")]
    pub auth_limit: u32,
    #[serde(default = "default_api_limit")]
    pub api_limit: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auth_limit: default_auth_limit(),
            api_limit: default_api_limit(),
            window_secs: default_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CookieConfig {
    #[serde(default = "default_true")]
    pub secure: bool,
    #[serde(default = "default_same_site")]
    pub same_site: String,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            secure: true,
            same_site: default_same_site(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CorsConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KernelConfig {
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub cookie: CookieConfig,

    #[serde(default)]
    pub cors: CorsConfig,

    #[serde(default = "default_csp_mode")]
    pub csp_mode: String,

    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default = "default_timeout_ms")]
    pub service_call_timeout_ms: u64,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    #[serde(default = "default_operation_log_capacity")]
    pub operation_log_capacity: usize,

    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: String,

    #[serde(default)]
    pub jwt_secret: Option<String>,

    #[serde(default)]
    pub bind_addr: Option<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            storage: StorageConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cookie: CookieConfig::default(),
            cors: CorsConfig::default(),
            csp_mode: default_csp_mode(),
            log_format: default_log_format(),
            service_call_timeout_ms: default_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            operation_log_capacity: default_operation_log_capacity(),
            plugin_dir: default_plugin_dir(),
            jwt_secret: None,
            bind_addr: None,
        }
    }
}

impl KernelConfig {
    /// Load config layering, lowest to highest precedence: built-in defaults,
    /// an optional `config.yaml` file, then `RUNTIME_*` environment variables
    /// with `__` as the nesting separator (e.g. `RUNTIME_STORAGE__BACKEND`).
    pub fn load() -> anyhow::Result<Self> {
        let figment = Figment::from(figment::providers::Serialized::defaults(
            KernelConfig::default(),
        ))
        .merge(Yaml::file("config.yaml"))
        .merge(Env::prefixed("RUNTIME_").split("__"));

        let config: KernelConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KernelResult<()> {
        if self.environment != "development" && self.environment != "production" {
            return Err(KernelError::ConfigError("environment must be 'development' or 'production'".into()));
        }
        if self.environment == "production" {
            if !self.cookie.secure {
                return Err(KernelError::ConfigError("production environment requires cookie.secure = true".into()));
            }
            if self.jwt_secret.as_deref().unwrap_or("").is_empty() {
                return Err(KernelError::ConfigError("production environment requires a non-empty jwt_secret".into()));
            }
        }
        if !matches!(self.storage.backend.as_str(), "memory" | "sqlite" | "postgres") {
            return Err(KernelError::ConfigError("storage.backend must be one of memory|sqlite|postgres".into()));
        }
        if self.storage.backend != "memory" && self.storage.dsn.is_empty() {
            return Err(KernelError::ConfigError(format!("storage.dsn is required for backend {}", self.storage.backend)));
        }
        Ok(())
    }
}
