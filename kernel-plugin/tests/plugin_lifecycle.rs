//! End-to-end plugin lifecycle scenarios driven through real manifest
//! files on disk, rather than through in-process `PluginManifest` values
//! like the unit tests in `src/manager.rs` use.

use async_trait::async_trait;
use kernel_core::event_bus::EventBus;
use kernel_core::http_registry::HttpRegistry;
use kernel_core::plugin::{Plugin, PluginMetadata, PluginState, RuntimeHandle};
use kernel_core::service_registry::ServiceRegistry;
use kernel_core::state_engine::StateEngine;
use kernel_core::storage::Storage;
use kernel_core::storage_mirror::StorageWithStateMirror;
use kernel_plugin::PluginManager;
use kernel_store::InMemoryAdapter;
use std::sync::Arc;
use tempfile::tempdir;

struct DemoPlugin;

#[async_trait]
impl Plugin for DemoPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            name: "demo".into(),
            version: "0.1.0".into(),
            description: String::new(),
            author: String::new(),
            dependencies: vec![],
        }
    }
}

fn demo_factory() -> Box<dyn Plugin> {
    Box::new(DemoPlugin)
}

fn test_runtime() -> Arc<RuntimeHandle> {
    Arc::new(RuntimeHandle {
        event_bus: EventBus::new(),
        service_registry: ServiceRegistry::new(None),
        http_registry: Arc::new(HttpRegistry::new()),
        storage: StorageWithStateMirror::new(Storage::new(Arc::new(InMemoryAdapter::new())), StateEngine::new()),
    })
}

fn write_manifest(dir: &std::path::Path, name: &str, deps: &[&str]) {
    let plugin_dir = dir.join(name);
    std::fs::create_dir_all(&plugin_dir).unwrap();
    let manifest = serde_json::json!({
        "class_path": "demo.plugin",
        "name": name,
        "version": "0.1.0",
        "dependencies": deps,
    });
    std::fs::write(plugin_dir.join("plugin.json"), serde_json::to_string_pretty(&manifest).unwrap()).unwrap();
}

#[tokio::test]
async fn dependency_ordering_is_respected_across_a_real_directory_scan() {
    let dir = tempdir().unwrap();
    // Written in arbitrary order; the manifest directory order must not
    // matter, only the declared dependency graph.
    write_manifest(dir.path(), "C", &["A", "B"]);
    write_manifest(dir.path(), "A", &[]);
    write_manifest(dir.path(), "B", &["A"]);

    let mut manager = PluginManager::new(test_runtime());
    manager.register_factory("demo.plugin", demo_factory);
    manager.auto_load_plugins(dir.path()).await;

    assert_eq!(manager.list_plugins(), vec!["A".to_string(), "B".to_string(), "C".to_string()]);
    assert_eq!(manager.get_plugin_state("A"), Some(PluginState::Loaded));
    assert_eq!(manager.get_plugin_state("B"), Some(PluginState::Loaded));
    assert_eq!(manager.get_plugin_state("C"), Some(PluginState::Loaded));
}

#[tokio::test]
async fn a_dependency_cycle_is_isolated_from_an_independent_plugin() {
    let dir = tempdir().unwrap();
    write_manifest(dir.path(), "A", &["B"]);
    write_manifest(dir.path(), "B", &["A"]);
    write_manifest(dir.path(), "C", &[]);

    let mut manager = PluginManager::new(test_runtime());
    manager.register_factory("demo.plugin", demo_factory);
    manager.auto_load_plugins(dir.path()).await;

    assert_eq!(manager.list_plugins(), vec!["C".to_string()]);
    assert_eq!(manager.get_plugin_state("A"), None);
    assert_eq!(manager.get_plugin_state("B"), None);
}

#[tokio::test]
async fn loaded_plugins_run_the_full_start_stop_unload_cycle() {
    let dir = tempdir().unwrap();
    write_manifest(dir.path(), "A", &[]);
    write_manifest(dir.path(), "B", &["A"]);

    let mut manager = PluginManager::new(test_runtime());
    manager.register_factory("demo.plugin", demo_factory);
    manager.auto_load_plugins(dir.path()).await;

    manager.start_all().await;
    assert_eq!(manager.get_plugin_state("A"), Some(PluginState::Started));
    assert_eq!(manager.get_plugin_state("B"), Some(PluginState::Started));

    manager.stop_all().await;
    assert_eq!(manager.get_plugin_state("A"), Some(PluginState::Stopped));
    assert_eq!(manager.get_plugin_state("B"), Some(PluginState::Stopped));

    manager.unload_plugin("B").await.unwrap();
    manager.unload_plugin("A").await.unwrap();
    assert!(manager.list_plugins().is_empty());
}
