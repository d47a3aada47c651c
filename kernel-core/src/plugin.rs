use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// `{class_path, name, version, description, author, dependencies}` as read
/// from a plugin's `plugin.json`. `class_path` is kept for interop with the
/// manifest schema even though Rust resolves it through a compile-time
/// [`crate::plugin::PluginFactory`] registry rather than dynamic loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub class_path: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Metadata a plugin reports about itself, independent of the manifest that
/// loaded it (a plugin may declare its dependencies dynamically during
/// `on_load`; the manager re-reads this after `on_load` completes).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginState {
    Unloaded,
    Loaded,
    Started,
    Stopped,
    Error,
}

/// Non-owning handle to the kernel's coordination primitives, handed to a
/// plugin before `on_load` runs and cleared on unload. The plugin never
/// owns the runtime; this rules out reference cycles and makes
/// `on_unload` a pure release step.
pub struct RuntimeHandle {
    pub event_bus: Arc<crate::event_bus::EventBus>,
    pub service_registry: Arc<crate::service_registry::ServiceRegistry>,
    pub http_registry: Arc<crate::http_registry::HttpRegistry>,
    pub storage: crate::storage_mirror::StorageWithStateMirror,
}

/// Lifecycle contract every plugin (and built-in module) satisfies.
/// `on_load` is where a plugin registers services, subscribes to events,
/// and registers HTTP contracts; `on_unload` must exactly undo it.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn metadata(&self) -> PluginMetadata;

    async fn on_load(&self, runtime: Arc<RuntimeHandle>) -> anyhow::Result<()> {
        let _ = runtime;
        Ok(())
    }
    async fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_unload(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Constructs a fresh plugin instance. Registered under a manifest's
/// `class_path` at compile time — the Rust-idiomatic analogue of the
/// spec's "fully qualified symbol" resolution, since there is no dynamic
/// class loading by string.
pub type PluginFactory = fn() -> Box<dyn Plugin>;
