use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

struct Inner {
    map: HashMap<String, Entry>,
}

/// In-memory key/value store with optional per-key TTL and a background
/// sweeper. All operations serialize on a single mutex, matching the
/// single-thread-of-control ordering guarantee the coordination layer
/// relies on.
pub struct StateEngine {
    inner: Mutex<Inner>,
    sweeper_running: Arc<AtomicBool>,
}

impl StateEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner { map: HashMap::new() }),
            sweeper_running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.map.get(key) {
            if let Some(exp) = entry.expires_at {
                if exp <= Utc::now() {
                    inner.map.remove(key);
                    return None;
                }
            }
            return inner.map.get(key).map(|e| e.value.clone());
        }
        None
    }

    pub fn set(&self, key: &str, value: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: None,
            },
        );
    }

    pub fn set_with_ttl(self: &Arc<Self>, key: &str, value: Value, ttl_secs: u64) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.map.insert(
                key.to_string(),
                Entry {
                    value,
                    expires_at: Some(Utc::now() + chrono::Duration::seconds(ttl_secs as i64)),
                },
            );
        }
        self.ensure_sweeper();
    }

    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.remove(key);
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let now = Utc::now();
        inner
            .map
            .iter()
            .filter(|(_, e)| e.expires_at.map(|exp| exp > now).unwrap_or(true))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn update(&self, entries: HashMap<String, Value>) {
        let mut inner = self.inner.lock().unwrap();
        for (k, v) in entries {
            inner.map.insert(k, Entry { value: v, expires_at: None });
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        if self
            .sweeper_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let has_ttl_entries = {
                    let mut inner = this.inner.lock().unwrap();
                    let now = Utc::now();
                    inner.map.retain(|_, e| e.expires_at.map(|exp| exp > now).unwrap_or(true));
                    inner.map.values().any(|e| e.expires_at.is_some())
                };
                if !has_ttl_entries {
                    this.sweeper_running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });
    }
}

impl Default for StateEngine {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner { map: HashMap::new() }),
            sweeper_running: Arc::new(AtomicBool::new(false)),
        }
    }
}
