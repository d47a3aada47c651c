use crate::error::{KernelError, KernelResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Uniform signature every service is published under: positional
/// variant-typed args plus a variant-typed keyword map, returning a
/// variant-typed result. The "variant" is a JSON value, matching the
/// spec's dynamic-dispatch-without-dynamic-typing design note.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn call(&self, args: Vec<Value>, kwargs: HashMap<String, Value>) -> KernelResult<Value>;
}

#[async_trait]
impl<F, Fut> ServiceHandler for F
where
    F: Fn(Vec<Value>, HashMap<String, Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = KernelResult<Value>> + Send,
{
    async fn call(&self, args: Vec<Value>, kwargs: HashMap<String, Value>) -> KernelResult<Value> {
        (self)(args, kwargs).await
    }
}

/// Hooks composed around a service at registration time.
pub trait ServiceMiddleware: Send + Sync {
    fn before_call(&self, _name: &str, _args: &[Value], _kwargs: &HashMap<String, Value>) {}
    fn after_call(&self, _name: &str, _result: &KernelResult<Value>) {}
    fn on_error(&self, _name: &str, _error: &KernelError) {}
}

struct ServiceEntry {
    handler: Arc<dyn ServiceHandler>,
    deprecated: AtomicBool,
}

/// Named async-callable registry. Registry mutations are serialized under a
/// single lock; `call` retrieves the callable under the lock, then invokes
/// it after releasing the lock so unrelated services never block each
/// other.
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, Arc<ServiceEntry>>>,
    default_timeout: Option<Duration>,
}

impl ServiceRegistry {
    pub fn new(default_timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            services: Mutex::new(HashMap::new()),
            default_timeout,
        })
    }

    pub fn register(&self, name: &str, handler: Arc<dyn ServiceHandler>) -> KernelResult<()> {
        let mut services = self.services.lock().unwrap();
        if services.contains_key(name) {
            return Err(KernelError::Conflict(format!("service {name} already registered")));
        }
        services.insert(
            name.to_string(),
            Arc::new(ServiceEntry {
                handler,
                deprecated: AtomicBool::new(false),
            }),
        );
        Ok(())
    }

    /// Registers `name` wrapped so `middleware` hooks fire around every
    /// call. The wrapping happens once, here, at registration time.
    pub fn register_with_middleware(
        &self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
        middleware: Vec<Arc<dyn ServiceMiddleware>>,
    ) -> KernelResult<()> {
        let wrapped: Arc<dyn ServiceHandler> = Arc::new(MiddlewareWrapped {
            inner: handler,
            middleware,
            name: name.to_string(),
        });
        self.register(name, wrapped)
    }

    pub fn register_versioned(
        &self,
        name: &str,
        version: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> KernelResult<()> {
        self.register(&format!("{name}.{version}"), handler)
    }

    pub fn unregister(&self, name: &str) {
        let mut services = self.services.lock().unwrap();
        services.remove(name);
    }

    pub fn has_service(&self, name: &str) -> bool {
        let services = self.services.lock().unwrap();
        services.contains_key(name)
    }

    pub fn list_services(&self) -> Vec<String> {
        let services = self.services.lock().unwrap();
        services.keys().cloned().collect()
    }

    pub fn get_versions(&self, name: &str) -> Vec<String> {
        let services = self.services.lock().unwrap();
        services
            .keys()
            .filter(|k| k.starts_with(&format!("{name}.")))
            .cloned()
            .collect()
    }

    pub fn is_deprecated(&self, name: &str) -> bool {
        let services = self.services.lock().unwrap();
        services
            .get(name)
            .map(|e| e.deprecated.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn mark_deprecated(&self, name: &str) {
        let services = self.services.lock().unwrap();
        if let Some(entry) = services.get(name) {
            entry.deprecated.store(true, Ordering::SeqCst);
        }
    }

    pub fn clear(&self) {
        let mut services = self.services.lock().unwrap();
        services.clear();
    }

    pub async fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
    ) -> KernelResult<Value> {
        match self.default_timeout {
            Some(timeout) => self.call_with_timeout(name, timeout, args, kwargs).await,
            None => self.call_inner(name, args, kwargs).await,
        }
    }

    pub async fn call_with_timeout(
        &self,
        name: &str,
        timeout: Duration,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
    ) -> KernelResult<Value> {
        match tokio::time::timeout(timeout, self.call_inner(name, args, kwargs)).await {
            Ok(result) => result,
            Err(_) => Err(KernelError::Timeout),
        }
    }

    async fn call_inner(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
    ) -> KernelResult<Value> {
        let entry = {
            let services = self.services.lock().unwrap();
            services
                .get(name)
                .cloned()
                .ok_or_else(|| KernelError::NotFound(format!("service {name}")))?
        };
        entry.handler.call(args, kwargs).await
    }
}

struct MiddlewareWrapped {
    inner: Arc<dyn ServiceHandler>,
    middleware: Vec<Arc<dyn ServiceMiddleware>>,
    name: String,
}

#[async_trait]
impl ServiceHandler for MiddlewareWrapped {
    async fn call(&self, args: Vec<Value>, kwargs: HashMap<String, Value>) -> KernelResult<Value> {
        for m in &self.middleware {
            m.before_call(&self.name, &args, &kwargs);
        }
        let result = self.inner.call(args, kwargs).await;
        for m in &self.middleware {
            m.after_call(&self.name, &result);
            if let Err(ref e) = result {
                m.on_error(&self.name, e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_handler() -> Arc<dyn ServiceHandler> {
        Arc::new(|args: Vec<Value>, _kwargs: HashMap<String, Value>| async move {
            Ok(Value::Array(args))
        })
    }

    #[tokio::test]
    async fn register_call_unregister_round_trip() {
        let registry = ServiceRegistry::new(None);
        registry.register("echo", echo_handler()).unwrap();
        let result = registry.call("echo", vec![Value::from(1)], HashMap::new()).await.unwrap();
        assert_eq!(result, Value::Array(vec![Value::from(1)]));
        registry.unregister("echo");
        assert!(!registry.has_service("echo"));
    }

    #[tokio::test]
    async fn calling_unknown_service_returns_not_found() {
        let registry = ServiceRegistry::new(None);
        let err = registry.call("nope", vec![], HashMap::new()).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let registry = ServiceRegistry::new(None);
        registry.register("echo", echo_handler()).unwrap();
        let err = registry.register("echo", echo_handler()).unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn reregistration_after_unregister_succeeds() {
        let registry = ServiceRegistry::new(None);
        registry.register("echo", echo_handler()).unwrap();
        registry.unregister("echo");
        assert!(registry.register("echo", echo_handler()).is_ok());
    }

    #[tokio::test]
    async fn slow_service_times_out() {
        let registry = ServiceRegistry::new(None);
        let slow: Arc<dyn ServiceHandler> = Arc::new(|_: Vec<Value>, _: HashMap<String, Value>| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Value::Null)
        });
        registry.register("slow", slow).unwrap();
        let err = registry
            .call_with_timeout("slow", Duration::from_millis(5), vec![], HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 504);
    }

    #[tokio::test]
    async fn mark_deprecated_is_observable_but_does_not_block_calls() {
        let registry = ServiceRegistry::new(None);
        registry.register("echo", echo_handler()).unwrap();
        registry.mark_deprecated("echo");
        assert!(registry.is_deprecated("echo"));
        assert!(registry.call("echo", vec![], HashMap::new()).await.is_ok());
    }

    struct CountingMiddleware {
        calls: Arc<Mutex<u32>>,
    }

    impl ServiceMiddleware for CountingMiddleware {
        fn before_call(&self, _name: &str, _args: &[Value], _kwargs: &HashMap<String, Value>) {
            *self.calls.lock().unwrap() += 1;
        }
    }

    #[tokio::test]
    async fn middleware_wraps_calls_at_registration_time() {
        let registry = ServiceRegistry::new(None);
        let calls = Arc::new(Mutex::new(0));
        registry
            .register_with_middleware(
                "echo",
                echo_handler(),
                vec![Arc::new(CountingMiddleware { calls: calls.clone() })],
            )
            .unwrap();
        registry.call("echo", vec![], HashMap::new()).await.unwrap();
        registry.call("echo", vec![], HashMap::new()).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), 2);
    }
}
