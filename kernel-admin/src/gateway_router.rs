use arc_swap::ArcSwap;
use kernel_core::http_registry::{HttpEndpoint, HttpMethod, HttpRegistry};
use matchit::Router as MatchitRouter;
use std::collections::HashMap;
use std::sync::Arc;

struct CompiledRouter {
    method_routers: HashMap<&'static str, MatchitRouter<Arc<str>>>,
}

/// Result of a route match: the owning service name plus path parameters
/// extracted from the matched segment.
pub struct RouteMatch {
    pub service_name: Arc<str>,
    pub params: Vec<(String, String)>,
}

/// A radix-tree router compiled from an `HttpRegistry` snapshot. The
/// gateway rebuilds this once at startup, after plugins have had their
/// grace period to register contracts — there is no per-request
/// recompilation, so lookups never touch the registry's own lock.
pub struct GatewayRouter {
    inner: ArcSwap<CompiledRouter>,
}

impl GatewayRouter {
    pub fn new() -> Self {
        Self { inner: ArcSwap::new(Arc::new(CompiledRouter { method_routers: HashMap::new() })) }
    }

    pub fn rebuild(&self, endpoints: &[HttpEndpoint]) {
        let mut method_routers: HashMap<&'static str, MatchitRouter<Arc<str>>> = HashMap::new();
        for endpoint in endpoints {
            let router = method_routers.entry(endpoint.method.as_str()).or_insert_with(MatchitRouter::new);
            let service_name: Arc<str> = Arc::from(endpoint.service_name.as_str());
            if let Err(e) = router.insert(endpoint.path.clone(), service_name) {
                tracing::warn!(path = %endpoint.path, method = endpoint.method.as_str(), error = %e, "failed to compile route, skipping");
            }
        }
        self.inner.store(Arc::new(CompiledRouter { method_routers }));
    }

    pub fn match_route(&self, method: HttpMethod, path: &str) -> Option<RouteMatch> {
        let compiled = self.inner.load();
        let router = compiled.method_routers.get(method.as_str())?;
        let matched = router.at(path).ok()?;
        let params = matched.params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Some(RouteMatch { service_name: Arc::clone(matched.value), params })
    }
}

impl Default for GatewayRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience: rebuild directly from a live `HttpRegistry`.
pub fn rebuild_from_registry(router: &GatewayRouter, registry: &HttpRegistry) {
    router.rebuild(&registry.list());
}
