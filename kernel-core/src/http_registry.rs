use crate::error::{KernelError, KernelResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// One declared HTTP contract. `deprecated` is interior-mutable because
/// `mark_deprecated` must be able to flip it without re-registering.
#[derive(Debug, Clone, Serialize)]
pub struct HttpEndpoint {
    pub method: HttpMethod,
    pub path: String,
    pub service_name: String,
    pub description: Option<String>,
    pub version: Option<String>,
    #[serde(skip)]
    deprecated: std::sync::Arc<AtomicBool>,
}

impl HttpEndpoint {
    pub fn is_deprecated(&self) -> bool {
        self.deprecated.load(Ordering::SeqCst)
    }

    /// Plugin ownership is inferred from the service name's first dotted
    /// segment (`devices.list` → owner `devices`).
    pub fn owner(&self) -> &str {
        self.service_name.split('.').next().unwrap_or("")
    }
}

fn normalize_path(path: &str, version: Option<&str>) -> KernelResult<String> {
    if !path.starts_with('/') {
        return Err(KernelError::InvalidInput("path must start with '/'".into()));
    }
    let mut normalized = if path.len() > 1 && path.ends_with('/') {
        path.trim_end_matches('/').to_string()
    } else {
        path.to_string()
    };
    if let Some(v) = version {
        normalized = format!("/{v}{normalized}");
    }
    Ok(normalized)
}

/// Declarative catalog of HTTP contracts. Purely a data structure — it does
/// not serve HTTP itself; the gateway compiles a snapshot of it into live
/// routes.
pub struct HttpRegistry {
    endpoints: Mutex<Vec<HttpEndpoint>>,
}

impl HttpRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(Vec::new()),
        }
    }

    pub fn register(
        &self,
        method: HttpMethod,
        path: &str,
        service_name: &str,
        description: Option<String>,
        version: Option<String>,
    ) -> KernelResult<()> {
        if service_name.is_empty() {
            return Err(KernelError::InvalidInput("service name must be non-empty".into()));
        }
        let normalized = normalize_path(path, version.as_deref())?;

        let mut endpoints = self.endpoints.lock().unwrap();
        if endpoints
            .iter()
            .any(|e| e.method == method && e.path == normalized)
        {
            return Err(KernelError::Conflict(format!(
                "duplicate endpoint {} {}",
                method.as_str(),
                normalized
            )));
        }

        endpoints.push(HttpEndpoint {
            method,
            path: normalized,
            service_name: service_name.to_string(),
            description,
            version,
            deprecated: std::sync::Arc::new(AtomicBool::new(false)),
        });
        Ok(())
    }

    pub fn list(&self) -> Vec<HttpEndpoint> {
        self.endpoints.lock().unwrap().clone()
    }

    /// Removes every endpoint owned by `plugin_name`, or all endpoints when
    /// `plugin_name` is `None`.
    pub fn clear(&self, plugin_name: Option<&str>) {
        let mut endpoints = self.endpoints.lock().unwrap();
        match plugin_name {
            Some(owner) => endpoints.retain(|e| e.owner() != owner),
            None => endpoints.clear(),
        }
    }

    pub fn get_versions(&self, service_name: &str) -> Vec<String> {
        let endpoints = self.endpoints.lock().unwrap();
        endpoints
            .iter()
            .filter(|e| e.service_name == service_name)
            .filter_map(|e| e.version.clone())
            .collect()
    }

    pub fn mark_deprecated(&self, method: HttpMethod, path: &str) {
        let endpoints = self.endpoints.lock().unwrap();
        if let Some(e) = endpoints.iter().find(|e| e.method == method && e.path == path) {
            e.deprecated.store(true, Ordering::SeqCst);
        }
    }

    /// Advisory OpenAPI-shaped document; no runtime dependency on its
    /// output.
    pub fn openapi_schema(&self) -> serde_json::Value {
        let endpoints = self.endpoints.lock().unwrap();
        let mut paths = serde_json::Map::new();
        for e in endpoints.iter() {
            let entry = paths
                .entry(e.path.clone())
                .or_insert_with(|| serde_json::json!({}));
            entry[e.method.as_str().to_lowercase()] = serde_json::json!({
                "operationId": e.service_name,
                "description": e.description,
                "deprecated": e.is_deprecated(),
            });
        }
        serde_json::json!({ "openapi": "3.0.0", "paths": paths })
    }
}

impl Default for HttpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_trailing_slash_except_root() {
        assert_eq!(normalize_path("/foo/", None).unwrap(), "/foo");
        assert_eq!(normalize_path("/", None).unwrap(), "/");
    }

    #[test]
    fn version_becomes_leading_segment() {
        assert_eq!(normalize_path("/devices", Some("v2")).unwrap(), "/v2/devices");
    }

    #[test]
    fn rejects_path_without_leading_slash() {
        assert!(normalize_path("devices", None).is_err());
    }

    #[test]
    fn duplicate_method_path_is_rejected() {
        let reg = HttpRegistry::new();
        reg.register(HttpMethod::Get, "/devices", "devices.list", None, None).unwrap();
        let err = reg
            .register(HttpMethod::Get, "/devices", "devices.list_v2", None, None)
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn clear_by_plugin_name_removes_only_its_endpoints() {
        let reg = HttpRegistry::new();
        reg.register(HttpMethod::Get, "/devices", "devices.list", None, None).unwrap();
        reg.register(HttpMethod::Get, "/automation", "automation.list", None, None).unwrap();
        reg.clear(Some("devices"));
        let remaining = reg.list();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].service_name, "automation.list");
    }
}
