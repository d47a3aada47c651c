use kernel_core::error::{KernelError, KernelResult};
use kernel_core::plugin::{Plugin, PluginFactory, PluginManifest, PluginMetadata, PluginState, RuntimeHandle};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

struct LoadedPlugin {
    plugin: Arc<dyn Plugin>,
    metadata: PluginMetadata,
    state: PluginState,
}

/// Discovers manifests on disk, orders plugins by declared dependencies,
/// and drives each through the UNLOADED → LOADED → STARTED → STOPPED →
/// UNLOADED state machine, isolating any one plugin's failure from the
/// rest of the batch.
pub struct PluginManager {
    runtime: Arc<RuntimeHandle>,
    factories: HashMap<String, PluginFactory>,
    registration_order: Mutex<Vec<String>>,
    plugins: Mutex<HashMap<String, LoadedPlugin>>,
}

impl PluginManager {
    pub fn new(runtime: Arc<RuntimeHandle>) -> Self {
        Self {
            runtime,
            factories: HashMap::new(),
            registration_order: Mutex::new(Vec::new()),
            plugins: Mutex::new(HashMap::new()),
        }
    }

    /// Registers the constructor reachable under `class_path`, the
    /// compile-time analogue of the manifest's "fully qualified symbol".
    pub fn register_factory(&mut self, class_path: &str, factory: PluginFactory) {
        self.factories.insert(class_path.to_string(), factory);
    }

    /// Scans `plugin_dir` one level deep for `*/plugin.json`. Manifests
    /// missing `class_path` or `name` are skipped with a warning, never a
    /// hard failure.
    pub fn discover(&self, plugin_dir: &Path) -> Vec<(PluginManifest, std::path::PathBuf)> {
        let mut found = Vec::new();
        let Ok(entries) = std::fs::read_dir(plugin_dir) else {
            warn!(dir = %plugin_dir.display(), "plugin directory not found");
            return found;
        };
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let manifest_path = dir.join("plugin.json");
            let Ok(raw) = std::fs::read_to_string(&manifest_path) else {
                continue;
            };
            match serde_json::from_str::<PluginManifest>(&raw) {
                Ok(manifest) if !manifest.class_path.is_empty() && !manifest.name.is_empty() => {
                    found.push((manifest, dir));
                }
                Ok(_) => warn!(path = %manifest_path.display(), "manifest missing class_path or name, skipping"),
                Err(e) => warn!(path = %manifest_path.display(), error = %e, "invalid manifest, skipping"),
            }
        }
        found
    }

    /// Topologically sorts manifests by `dependencies` (Kahn's algorithm).
    /// Plugins inside a dependency cycle are skipped with a warning;
    /// plugins outside the cycle continue. Missing dependencies also
    /// cause the dependent plugin to be skipped, without blocking the
    /// batch.
    pub fn order(&self, manifests: &[PluginManifest]) -> Vec<PluginManifest> {
        let names: HashSet<&str> = manifests.iter().map(|m| m.name.as_str()).collect();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for m in manifests {
            let valid_deps: Vec<&str> = m
                .dependencies
                .iter()
                .map(|d| d.as_str())
                .filter(|d| names.contains(d))
                .collect();
            for dep in &m.dependencies {
                if !names.contains(dep.as_str()) {
                    warn!(plugin = %m.name, dependency = %dep, "missing dependency, plugin will be skipped");
                }
            }
            in_degree.insert(&m.name, valid_deps.len());
            for dep in valid_deps {
                dependents.entry(dep).or_default().push(&m.name);
            }
        }

        let by_name: HashMap<&str, &PluginManifest> =
            manifests.iter().map(|m| (m.name.as_str(), m)).collect();

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&name, _)| name)
            .collect();
        // Also drop manifests with an unmet (missing) dependency — Kahn's
        // algorithm alone would stall them with in_degree > 0 forever,
        // which is indistinguishable from a genuine cycle; that's fine,
        // both are "skipped but don't block the rest."
        let mut ordered = Vec::new();
        let mut in_degree = in_degree;

        while let Some(name) = queue.pop_front() {
            ordered.push(name);
            if let Some(deps) = dependents.get(name) {
                for &dependent in deps {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        let skipped: Vec<&str> = manifests
            .iter()
            .map(|m| m.name.as_str())
            .filter(|n| !ordered.contains(n))
            .collect();
        for name in &skipped {
            warn!(plugin = %name, "skipped: inside a dependency cycle or missing a dependency");
        }

        ordered.into_iter().filter_map(|n| by_name.get(n).map(|m| (*m).clone())).collect()
    }

    /// Loads `manifest` via the factory registered under its `class_path`.
    /// Refuses if the name is already present, or if the plugin's
    /// post-`on_load` declared dependencies are not all LOADED.
    pub async fn load_plugin(&self, manifest: &PluginManifest) -> KernelResult<()> {
        {
            let plugins = self.plugins.lock().unwrap();
            if plugins.contains_key(&manifest.name) {
                return Err(KernelError::Conflict(format!("plugin {} already loaded", manifest.name)));
            }
        }

        let factory = self
            .factories
            .get(&manifest.class_path)
            .ok_or_else(|| KernelError::NotFound(format!("no factory for class_path {}", manifest.class_path)))?;

        let plugin: Arc<dyn Plugin> = Arc::from(factory());

        let load_result = plugin.on_load(Arc::clone(&self.runtime)).await;
        if let Err(e) = load_result {
            self.record_error(&manifest.name, plugin, manifest, e.to_string());
            return Err(KernelError::PluginLifecycleError { plugin: manifest.name.clone(), source: e });
        }

        // Re-read metadata: on_load may have mutated the plugin's own
        // declared dependencies. Manifest dependencies override whatever
        // the plugin reports internally.
        let mut metadata = plugin.metadata();
        metadata.dependencies = manifest.dependencies.clone();

        {
            let plugins = self.plugins.lock().unwrap();
            for dep in &metadata.dependencies {
                match plugins.get(dep) {
                    Some(p) if p.state == PluginState::Loaded || p.state == PluginState::Started => {}
                    _ => {
                        return Err(KernelError::DependencyMissing(format!(
                            "{} requires {} to be LOADED",
                            manifest.name, dep
                        )));
                    }
                }
            }
        }

        let mut plugins = self.plugins.lock().unwrap();
        plugins.insert(
            manifest.name.clone(),
            LoadedPlugin { plugin, metadata, state: PluginState::Loaded },
        );
        self.registration_order.lock().unwrap().push(manifest.name.clone());
        info!(plugin = %manifest.name, "loaded");
        Ok(())
    }

    fn record_error(&self, name: &str, _plugin: Arc<dyn Plugin>, manifest: &PluginManifest, reason: String) {
        warn!(plugin = name, error = %reason, "on_load failed, marking ERROR");
        let mut plugins = self.plugins.lock().unwrap();
        plugins.insert(
            name.to_string(),
            LoadedPlugin {
                plugin: _plugin,
                metadata: PluginMetadata {
                    name: manifest.name.clone(),
                    version: manifest.version.clone(),
                    description: manifest.description.clone(),
                    author: manifest.author.clone(),
                    dependencies: manifest.dependencies.clone(),
                },
                state: PluginState::Error,
            },
        );
    }

    /// Discovers, orders, and loads every plugin under `plugin_dir`,
    /// best-effort: a plugin's failure is isolated and does not abort the
    /// rest of the batch.
    pub async fn auto_load_plugins(&self, plugin_dir: &Path) {
        let manifests: Vec<PluginManifest> =
            self.discover(plugin_dir).into_iter().map(|(m, _)| m).collect();
        let ordered = self.order(&manifests);
        for manifest in &ordered {
            if let Err(e) = self.load_plugin(manifest).await {
                warn!(plugin = %manifest.name, error = %e, "failed to load");
            }
        }
    }

    pub fn get_plugin_state(&self, name: &str) -> Option<PluginState> {
        self.plugins.lock().unwrap().get(name).map(|p| p.state)
    }

    pub fn list_plugins(&self) -> Vec<String> {
        self.registration_order.lock().unwrap().clone()
    }

    pub async fn start_plugin(&self, name: &str) -> KernelResult<()> {
        let plugin = {
            let plugins = self.plugins.lock().unwrap();
            let entry = plugins
                .get(name)
                .ok_or_else(|| KernelError::NotFound(format!("plugin {name}")))?;
            if entry.state != PluginState::Loaded {
                return Err(KernelError::InvalidInput(format!("plugin {name} is not LOADED")));
            }
            Arc::clone(&entry.plugin)
        };

        match plugin.on_start().await {
            Ok(()) => {
                self.plugins.lock().unwrap().get_mut(name).unwrap().state = PluginState::Started;
                Ok(())
            }
            Err(e) => {
                self.plugins.lock().unwrap().get_mut(name).unwrap().state = PluginState::Error;
                Err(KernelError::PluginLifecycleError { plugin: name.to_string(), source: e })
            }
        }
    }

    /// Starts every LOADED plugin in registration order. A failing
    /// plugin is logged and skipped; the batch continues.
    pub async fn start_all(&self) {
        let names = self.list_plugins();
        for name in names {
            if self.get_plugin_state(&name) == Some(PluginState::Loaded) {
                if let Err(e) = self.start_plugin(&name).await {
                    warn!(plugin = %name, error = %e, "failed to start");
                }
            }
        }
    }

    pub async fn stop_plugin(&self, name: &str) -> KernelResult<()> {
        let plugin = {
            let plugins = self.plugins.lock().unwrap();
            let entry = plugins
                .get(name)
                .ok_or_else(|| KernelError::NotFound(format!("plugin {name}")))?;
            Arc::clone(&entry.plugin)
        };
        match plugin.on_stop().await {
            Ok(()) => {
                self.plugins.lock().unwrap().get_mut(name).unwrap().state = PluginState::Stopped;
                Ok(())
            }
            Err(e) => {
                self.plugins.lock().unwrap().get_mut(name).unwrap().state = PluginState::Error;
                Err(KernelError::PluginLifecycleError { plugin: name.to_string(), source: e })
            }
        }
    }

    pub async fn stop_all(&self) {
        let names = self.list_plugins();
        for name in names {
            if self.get_plugin_state(&name) == Some(PluginState::Started) {
                if let Err(e) = self.stop_plugin(&name).await {
                    warn!(plugin = %name, error = %e, "failed to stop");
                }
            }
        }
    }

    /// Stops first if STARTED, then calls `on_unload`, then removes the
    /// plugin from the registry.
    pub async fn unload_plugin(&self, name: &str) -> KernelResult<()> {
        if self.get_plugin_state(name) == Some(PluginState::Started) {
            self.stop_plugin(name).await?;
        }
        let plugin = {
            let plugins = self.plugins.lock().unwrap();
            let entry = plugins
                .get(name)
                .ok_or_else(|| KernelError::NotFound(format!("plugin {name}")))?;
            Arc::clone(&entry.plugin)
        };
        plugin
            .on_unload()
            .await
            .map_err(|e| KernelError::PluginLifecycleError { plugin: name.to_string(), source: e })?;

        self.plugins.lock().unwrap().remove(name);
        self.registration_order.lock().unwrap().retain(|n| n != name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kernel_core::event_bus::EventBus;
    use kernel_core::http_registry::HttpRegistry;
    use kernel_core::service_registry::ServiceRegistry;
    use kernel_core::storage::StorageAdapter;
    use kernel_core::storage_mirror::StorageWithStateMirror;
    use kernel_core::state_engine::StateEngine;
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
            storage: StorageWithStateMirror::new(
                kernel_core::storage::Storage::new(Arc::new(NullAdapter)),
                StateEngine::new(),
            ),
        })
    }

    struct TestPlugin(&'static str, Vec<String>);
    #[async_trait]
    impl Plugin for TestPlugin {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata {
                name: self.0.to_string(),
                version: "0.1.0".into(),
                description: String::new(),
                author: String::new(),
                dependencies: self.1.clone(),
            }
        }
    }

    fn manifest(name: &str, deps: &[&str]) -> PluginManifest {
        PluginManifest {
            class_path: format!("test::{name}"),
            name: name.to_string(),
            version: "0.1.0".into(),
            description: String::new(),
            author: String::new(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn dependency_ordering_respects_declared_deps() {
        let manager = PluginManager::new(test_runtime());
        let manifests = vec![
            manifest("C", &["A", "B"]),
            manifest("A", &[]),
            manifest("B", &["A"]),
        ];
        let ordered: Vec<String> = manager.order(&manifests).into_iter().map(|m| m.name).collect();
        assert_eq!(ordered, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
    }

    #[test]
    fn cycle_is_isolated_independent_plugin_continues() {
        let manager = PluginManager::new(test_runtime());
        let manifests = vec![
            manifest("A", &["B"]),
            manifest("B", &["A"]),
            manifest("C", &[]),
        ];
        let ordered: Vec<String> = manager.order(&manifests).into_iter().map(|m| m.name).collect();
        assert_eq!(ordered, vec!["C".to_string()]);
    }

    #[tokio::test]
    async fn load_start_stop_unload_lifecycle() {
        let mut manager = PluginManager::new(test_runtime());
        manager.register_factory("test::A", || Box::new(TestPlugin("A", vec![])));
        let m = manifest("A", &[]);
        manager.load_plugin(&m).await.unwrap();
        assert_eq!(manager.get_plugin_state("A"), Some(PluginState::Loaded));
        manager.start_plugin("A").await.unwrap();
        assert_eq!(manager.get_plugin_state("A"), Some(PluginState::Started));
        manager.stop_plugin("A").await.unwrap();
        assert_eq!(manager.get_plugin_state("A"), Some(PluginState::Stopped));
        manager.unload_plugin("A").await.unwrap();
        assert_eq!(manager.get_plugin_state("A"), None);
    }

    #[tokio::test]
    async fn loading_with_missing_dependency_is_refused() {
        let mut manager = PluginManager::new(test_runtime());
        manager.register_factory("test::B", || Box::new(TestPlugin("B", vec!["A".to_string()])));
        let m = manifest("B", &["A"]);
        let err = manager.load_plugin(&m).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn duplicate_load_is_refused() {
        let mut manager = PluginManager::new(test_runtime());
        manager.register_factory("test::A", || Box::new(TestPlugin("A", vec![])));
        let m = manifest("A", &[]);
        manager.load_plugin(&m).await.unwrap();
        let err = manager.load_plugin(&m).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
    }
}
