use kernel_core::config::KernelConfig;
use kernel_core::error::{KernelError, KernelResult};
use kernel_core::event_bus::EventBus;
use kernel_core::http_registry::HttpRegistry;
use kernel_core::plugin::{PluginState, RuntimeHandle};
use kernel_core::service_registry::ServiceRegistry;
use kernel_core::state_engine::StateEngine;
use kernel_core::storage::Storage;
use kernel_core::storage_mirror::StorageWithStateMirror;
use kernel_modules::{AuthBoundary, AuthModule};
use kernel_observability::request_logger::with_system_scope;
use kernel_observability::{RequestLogger, RequestLoggerModule};
use kernel_plugin::{ModuleManager, PluginManager};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Owns every coordination primitive and sequences startup/shutdown the
/// way a single-process kernel must: construct everything up front,
/// register and start built-in modules before user plugins, and unwind
/// cleanly on any failure partway through.
pub struct CoreRuntime {
    pub event_bus: Arc<EventBus>,
    pub service_registry: Arc<ServiceRegistry>,
    pub state_engine: Arc<StateEngine>,
    pub storage: StorageWithStateMirror,
    pub http_registry: Arc<HttpRegistry>,
    pub plugin_manager: PluginManager,
    pub module_manager: ModuleManager,
    pub runtime_handle: Arc<RuntimeHandle>,
    pub auth: Arc<AuthBoundary>,
    pub request_logger: Arc<RequestLogger>,
    config: Arc<KernelConfig>,
    running: AtomicBool,
    start_time: Mutex<Option<Instant>>,
}

impl CoreRuntime {
    pub fn new(storage_adapter: Arc<dyn kernel_core::storage::StorageAdapter>, config: Arc<KernelConfig>) -> Self {
        let event_bus = EventBus::new();
        let service_registry = ServiceRegistry::new(Some(std::time::Duration::from_millis(config.service_call_timeout_ms)));
        let state_engine = StateEngine::new();
        let storage = StorageWithStateMirror::new(Storage::new(storage_adapter), Arc::clone(&state_engine));
        let http_registry = Arc::new(HttpRegistry::new());

        let runtime_handle = Arc::new(RuntimeHandle {
            event_bus: Arc::clone(&event_bus),
            service_registry: Arc::clone(&service_registry),
            http_registry: Arc::clone(&http_registry),
            storage: storage.clone(),
        });

        let plugin_manager = PluginManager::new(Arc::clone(&runtime_handle));
        let module_manager = ModuleManager::new(Arc::clone(&runtime_handle));
        let auth = Arc::new(AuthBoundary::new(storage.clone()));
        let request_logger = RequestLogger::new(config.operation_log_capacity);

        Self {
            event_bus,
            service_registry,
            state_engine,
            storage,
            http_registry,
            plugin_manager,
            module_manager,
            runtime_handle,
            auth,
            request_logger,
            config,
            running: AtomicBool::new(false),
            start_time: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Auto-loads user plugins if none are already loaded, registers and
    /// starts the REQUIRED built-in modules (auth, request logging),
    /// then starts user plugins. A REQUIRED module failing to register
    /// or start aborts the sequence and rolls every started module back.
    pub async fn start(&self) -> KernelResult<()> {
        if self.is_running() {
            return Ok(());
        }

        let result: KernelResult<()> = async {
            if self.plugin_manager.list_plugins().is_empty() {
                self.plugin_manager.auto_load_plugins(&PathBuf::from(&self.config.plugin_dir)).await;
            }

            self.module_manager.register_builtin_module(Arc::new(AuthModule::new(Arc::clone(&self.auth))), true).await?;
            self.module_manager
                .register_builtin_module(Arc::new(RequestLoggerModule::new(Arc::clone(&self.request_logger))), true)
                .await?;

            let required = self.module_manager.required_modules();
            for name in &required {
                if self.module_manager.get_module_state(name).is_none() {
                    return Err(KernelError::DependencyMissing(format!("required module {name} did not register")));
                }
            }

            let modules = self.module_manager.list_modules();
            if !modules.is_empty() {
                info!(?modules, "builtin modules registered");
            }
            self.module_manager.start_all().await?;

            let auth = Arc::clone(&self.auth);
            with_system_scope(Arc::clone(&self.request_logger), "auth.jwt_secret_refresh", || async move {
                auth.warm_jwt_secret().await
            })
            .await?;

            let plugins = self.plugin_manager.list_plugins();
            self.plugin_manager.start_all().await;
            if !plugins.is_empty() {
                info!(?plugins, "plugins started");
            }

            self.state_engine.set("runtime.status", json!("running"));
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.running.store(true, Ordering::SeqCst);
                *self.start_time.lock().unwrap() = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                self.module_manager.stop_all().await;
                Err(e)
            }
        }
    }

    /// Stops plugins, then modules, then closes storage, bounded by
    /// `shutdown_timeout_ms`. On timeout the runtime is force-flagged
    /// stopped and the timeout is surfaced as an error.
    pub async fn stop(&self) -> KernelResult<()> {
        if !self.is_running() {
            return Ok(());
        }
        let timeout = std::time::Duration::from_millis(self.config.shutdown_timeout_ms);

        let stop_sequence = async {
            self.plugin_manager.stop_all().await;
            self.module_manager.stop_all().await;
            self.storage.close().await?;
            self.state_engine.set("runtime.status", json!("stopped"));
            Ok::<(), KernelError>(())
        };

        match tokio::time::timeout(timeout, stop_sequence).await {
            Ok(result) => {
                self.running.store(false, Ordering::SeqCst);
                result
            }
            Err(_) => {
                warn!(timeout_ms = self.config.shutdown_timeout_ms, "timed out stopping runtime, forcing stopped state");
                self.running.store(false, Ordering::SeqCst);
                Err(KernelError::Timeout)
            }
        }
    }

    pub async fn shutdown(&self) -> KernelResult<()> {
        let result = self.stop().await;
        self.module_manager.clear();
        self.event_bus.clear().await;
        self.service_registry.clear();
        self.state_engine.clear();
        result
    }

    pub async fn health_check(&self) -> Value {
        let mut checks = serde_json::Map::new();
        let mut overall = HealthStatus::Healthy;

        match self.storage.get("health_check", "test").await {
            Ok(_) => {
                checks.insert("storage".into(), json!("healthy"));
            }
            Err(e) => {
                checks.insert("storage".into(), json!("unhealthy"));
                checks.insert("storage_error".into(), json!(e.to_string()));
                overall = HealthStatus::Unhealthy;
            }
        }

        let modules = self.module_manager.list_modules();
        let required = self.module_manager.required_modules();
        let missing: Vec<&String> = required.iter().filter(|m| !modules.contains(m)).collect();
        if missing.is_empty() {
            checks.insert("modules".into(), json!("healthy"));
        } else {
            checks.insert("modules".into(), json!("unhealthy"));
            checks.insert("modules_error".into(), json!(format!("missing required modules: {missing:?}")));
            overall = HealthStatus::Unhealthy;
        }

        let plugins = self.plugin_manager.list_plugins();
        let error_plugins: Vec<&String> = plugins.iter().filter(|p| self.plugin_manager.get_plugin_state(p) == Some(PluginState::Error)).collect();
        if error_plugins.is_empty() {
            checks.insert("plugins".into(), json!("healthy"));
        } else {
            checks.insert("plugins".into(), json!("degraded"));
            checks.insert("plugins_error".into(), json!(format!("plugins in error state: {error_plugins:?}")));
            if overall == HealthStatus::Healthy {
                overall = HealthStatus::Degraded;
            }
        }

        json!({
            "status": overall,
            "uptime_secs": self.uptime_secs(),
            "checks": checks,
        })
    }

    pub fn get_metrics(&self) -> Value {
        let plugins = self.plugin_manager.list_plugins();
        let plugin_states: serde_json::Map<String, Value> = plugins
            .iter()
            .filter_map(|name| self.plugin_manager.get_plugin_state(name).map(|s| (name.clone(), json!(format!("{s:?}")))))
            .collect();
        let started_count = plugins.iter().filter(|name| self.plugin_manager.get_plugin_state(name) == Some(PluginState::Started)).count();

        let modules = self.module_manager.list_modules();

        let endpoints = self.http_registry.list();
        let mut by_method = serde_json::Map::new();
        for endpoint in &endpoints {
            let key = endpoint.method.as_str().to_string();
            let count = by_method.get(&key).and_then(|v| v.as_u64()).unwrap_or(0);
            by_method.insert(key, json!(count + 1));
        }

        json!({
            "uptime_secs": self.uptime_secs(),
            "plugins": { "total": plugins.len(), "started": started_count, "states": plugin_states },
            "modules": { "total": modules.len(), "list": modules },
            "services": { "total": self.service_registry.list_services().len() },
            "http_endpoints": { "total": endpoints.len(), "by_method": by_method },
        })
    }

    fn uptime_secs(&self) -> f64 {
        self.start_time.lock().unwrap().map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_store::InMemoryAdapter;

    fn runtime() -> CoreRuntime {
        CoreRuntime::new(Arc::new(InMemoryAdapter::new()), Arc::new(KernelConfig::default()))
    }

    #[tokio::test]
    async fn start_then_stop_flips_running_and_status() {
        let rt = runtime();
        rt.start().await.unwrap();
        assert!(rt.is_running());
        assert_eq!(rt.state_engine.get("runtime.status"), Some(json!("running")));
        rt.stop().await.unwrap();
        assert!(!rt.is_running());
        assert_eq!(rt.state_engine.get("runtime.status"), Some(json!("stopped")));
    }

    #[tokio::test]
    async fn health_check_is_healthy_after_start() {
        let rt = runtime();
        rt.start().await.unwrap();
        let health = rt.health_check().await;
        assert_eq!(health["status"], json!("healthy"));
    }

    #[tokio::test]
    async fn metrics_report_registered_services_and_endpoints() {
        let rt = runtime();
        rt.start().await.unwrap();
        let metrics = rt.get_metrics();
        assert!(metrics["services"]["total"].as_u64().unwrap() >= 4);
        assert!(metrics["http_endpoints"]["total"].as_u64().unwrap() >= 4);
    }

    #[tokio::test]
    async fn double_start_is_a_no_op() {
        let rt = runtime();
        rt.start().await.unwrap();
        rt.start().await.unwrap();
        assert!(rt.is_running());
    }

    #[tokio::test]
    async fn shutdown_clears_modules_and_services() {
        let rt = runtime();
        rt.start().await.unwrap();
        rt.shutdown().await.unwrap();
        assert!(rt.module_manager.list_modules().is_empty());
        assert!(rt.service_registry.list_services().is_empty());
    }
}
