use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// A subscriber to one event type. Implementations should treat failures
/// as isolated: a panic or error inside `handle` never reaches the
/// publisher.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, payload: Value);
}

/// Typed pub/sub bus. `publish` snapshots the current handler list, runs
/// every handler concurrently, and waits for all of them — handler
/// failures are isolated and never propagate to the publisher.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
        })
    }

    pub async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        let mut subs = self.subscribers.write().await;
        subs.entry(event_type.to_string()).or_default().push(handler);
    }

    /// Removes a handler by pointer identity. O(n) in the number of
    /// subscribers for the event type.
    pub async fn unsubscribe(&self, event_type: &str, handler: &Arc<dyn EventHandler>) {
        let mut subs = self.subscribers.write().await;
        if let Some(list) = subs.get_mut(event_type) {
            list.retain(|h| !Arc::ptr_eq(h, handler));
        }
    }

    pub async fn publish(&self, event_type: &str, payload: Value) {
        let snapshot: Vec<Arc<dyn EventHandler>> = {
            let subs = self.subscribers.read().await;
            subs.get(event_type).cloned().unwrap_or_default()
        };

        let mut tasks = Vec::with_capacity(snapshot.len());
        for handler in snapshot {
            let payload = payload.clone();
            tasks.push(tokio::spawn(async move {
                handler.handle(payload).await;
            }));
        }

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, event_type, "event handler panicked");
            }
        }
    }

    pub async fn get_subscribers_count(&self, event_type: &str) -> usize {
        let subs = self.subscribers.read().await;
        subs.get(event_type).map(|v| v.len()).unwrap_or(0)
    }

    pub async fn clear(&self) {
        let mut subs = self.subscribers.write().await;
        subs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Recorder(Arc<AtomicBool>);

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, _payload: Value) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    struct Panicker;

    #[async_trait]
    impl EventHandler for Panicker {
        async fn handle(&self, _payload: Value) {
            panic!("handler failure must be isolated");
        }
    }

    #[tokio::test]
    async fn publish_runs_all_handlers_and_isolates_failures() {
        let bus = EventBus::new();
        let flag = Arc::new(AtomicBool::new(false));
        bus.subscribe("e", Arc::new(Panicker)).await;
        bus.subscribe("e", Arc::new(Recorder(flag.clone()))).await;

        bus.publish("e", serde_json::json!({})).await;

        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn subscriber_count_reflects_subscriptions() {
        let bus = EventBus::new();
        assert_eq!(bus.get_subscribers_count("e").await, 0);
        bus.subscribe("e", Arc::new(Recorder(Arc::new(AtomicBool::new(false))))).await;
        assert_eq!(bus.get_subscribers_count("e").await, 1);
    }

    #[tokio::test]
    async fn clear_removes_all_subscriptions() {
        let bus = EventBus::new();
        bus.subscribe("e", Arc::new(Recorder(Arc::new(AtomicBool::new(false))))).await;
        bus.clear().await;
        assert_eq!(bus.get_subscribers_count("e").await, 0);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_returns_immediately() {
        let bus = EventBus::new();
        bus.publish("nobody-home", serde_json::json!(null)).await;
    }
}
