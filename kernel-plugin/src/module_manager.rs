use kernel_core::error::{KernelError, KernelResult};
use kernel_core::plugin::{Plugin, PluginState, RuntimeHandle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

struct BuiltinEntry {
    plugin: Arc<dyn Plugin>,
    required: bool,
    state: PluginState,
}

/// Drives the kernel's own built-in modules (auth, authorization, the
/// HTTP gateway, request logging, ...) through the same lifecycle state
/// machine as user plugins, but with a REQUIRED/OPTIONAL distinction:
/// a REQUIRED module failing to register or start is fatal to boot,
/// while an OPTIONAL module's failure is logged and otherwise ignored.
pub struct ModuleManager {
    runtime: Arc<RuntimeHandle>,
    modules: Mutex<HashMap<String, BuiltinEntry>>,
    order: Mutex<Vec<String>>,
}

impl ModuleManager {
    pub fn new(runtime: Arc<RuntimeHandle>) -> Self {
        Self { runtime, modules: Mutex::new(HashMap::new()), order: Mutex::new(Vec::new()) }
    }

    /// Registers and loads one built-in module. REQUIRED failures
    /// propagate; OPTIONAL failures are logged and the module is simply
    /// absent from the registry afterward.
    pub async fn register_builtin_module(&self, plugin: Arc<dyn Plugin>, required: bool) -> KernelResult<()> {
        let name = plugin.metadata().name;
        match plugin.on_load(Arc::clone(&self.runtime)).await {
            Ok(()) => {
                self.modules.lock().unwrap().insert(name.clone(), BuiltinEntry { plugin, required, state: PluginState::Loaded });
                self.order.lock().unwrap().push(name.clone());
                info!(module = %name, "builtin module loaded");
                Ok(())
            }
            Err(e) => {
                if required {
                    error!(module = %name, error = %e, "required builtin module failed to load");
                    Err(KernelError::PluginLifecycleError { plugin: name, source: e })
                } else {
                    warn!(module = %name, error = %e, "optional builtin module failed to load, continuing without it");
                    Ok(())
                }
            }
        }
    }

    /// Starts every registered module in registration order. If a
    /// REQUIRED module fails to start, already-started modules are
    /// stopped (best-effort) and the original error is returned.
    pub async fn start_all(&self) -> KernelResult<()> {
        let names = self.order.lock().unwrap().clone();
        for name in &names {
            let (plugin, required) = {
                let modules = self.modules.lock().unwrap();
                let entry = match modules.get(name) {
                    Some(e) => e,
                    None => continue,
                };
                (Arc::clone(&entry.plugin), entry.required)
            };

            match plugin.on_start().await {
                Ok(()) => {
                    self.modules.lock().unwrap().get_mut(name).unwrap().state = PluginState::Started;
                }
                Err(e) => {
                    self.modules.lock().unwrap().get_mut(name).unwrap().state = PluginState::Error;
                    if required {
                        error!(module = %name, error = %e, "required builtin module failed to start, rolling back");
                        self.stop_all().await;
                        return Err(KernelError::PluginLifecycleError { plugin: name.clone(), source: e });
                    }
                    warn!(module = %name, error = %e, "optional builtin module failed to start, continuing");
                }
            }
        }
        Ok(())
    }

    /// Stops every STARTED module in reverse registration order,
    /// tolerating individual failures.
    pub async fn stop_all(&self) {
        let mut names = self.order.lock().unwrap().clone();
        names.reverse();
        for name in &names {
            let plugin = {
                let modules = self.modules.lock().unwrap();
                match modules.get(name) {
                    Some(e) if e.state == PluginState::Started => Arc::clone(&e.plugin),
                    _ => continue,
                }
            };
            if let Err(e) = plugin.on_stop().await {
                warn!(module = %name, error = %e, "error stopping builtin module, continuing shutdown");
            }
            self.modules.lock().unwrap().get_mut(name).unwrap().state = PluginState::Stopped;
        }
    }

    pub fn get_module_state(&self, name: &str) -> Option<PluginState> {
        self.modules.lock().unwrap().get(name).map(|e| e.state)
    }

    pub fn list_modules(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    pub fn required_modules(&self) -> Vec<String> {
        self.modules.lock().unwrap().iter().filter(|(_, e)| e.required).map(|(name, _)| name.clone()).collect()
    }

    /// Drops every registered module without running lifecycle hooks —
    /// only safe to call after `stop_all` has already run, as part of a
    /// full runtime shutdown.
    pub fn clear(&self) {
        self.modules.lock().unwrap().clear();
        self.order.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kernel_core::event_bus::EventBus;
    use kernel_core::http_registry::HttpRegistry;
    use kernel_core::plugin::PluginMetadata;
    use kernel_core::service_registry::ServiceRegistry;
    use kernel_core::state_engine::StateEngine;
    use kernel_core::storage::{Storage, StorageAdapter};
    use kernel_core::storage_mirror::StorageWithStateMirror;
    use serde_json::Value;

    struct NullAdapter;
    #[async_trait]
    impl StorageAdapter for NullAdapter {
        async fn get(&self, _n: &str, _k: &str) -> KernelResult<Option<Value>> { Ok(None) }
        async fn set(&self, _n: &str, _k: &str, _v: Value) -> KernelResult<()> { Ok(()) }
        async fn delete(&self, _n: &str, _k: &str) -> KernelResult<()> { Ok(()) }
        async fn list_keys(&self, _n: &str) -> KernelResult<Vec<String>> { Ok(vec![]) }
        async fn clear_namespace(&self, _n: &str) -> KernelResult<()> { Ok(()) }
        async fn close(&self) -> KernelResult<()> { Ok(()) }
    }

    fn test_runtime() -> Arc<RuntimeHandle> {
        Arc::new(RuntimeHandle {
            event_bus: EventBus::new(),
            service_registry: ServiceRegistry::new(None),
            http_registry: Arc::new(HttpRegistry::new()),
            storage: StorageWithStateMirror::new(Storage::new(Arc::new(NullAdapter)), StateEngine::new()),
        })
    }

    struct GoodModule;
    #[async_trait]
    impl Plugin for GoodModule {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata { name: "good".into(), version: "1.0".into(), description: String::new(), author: String::new(), dependencies: vec![] }
        }
    }

    struct FailsToStart;
    #[async_trait]
    impl Plugin for FailsToStart {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata { name: "bad".into(), version: "1.0".into(), description: String::new(), author: String::new(), dependencies: vec![] }
        }
        async fn on_start(&self) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn required_module_start_failure_rolls_back_and_propagates() {
        let manager = ModuleManager::new(test_runtime());
        manager.register_builtin_module(Arc::new(GoodModule), true).await.unwrap();
        manager.register_builtin_module(Arc::new(FailsToStart), true).await.unwrap();
        let err = manager.start_all().await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert_eq!(manager.get_module_state("good"), Some(PluginState::Stopped));
    }

    #[tokio::test]
    async fn optional_module_start_failure_is_tolerated() {
        let manager = ModuleManager::new(test_runtime());
        manager.register_builtin_module(Arc::new(FailsToStart), false).await.unwrap();
        manager.start_all().await.unwrap();
        assert_eq!(manager.get_module_state("bad"), Some(PluginState::Error));
    }
}
