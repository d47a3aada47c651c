use async_trait::async_trait;
use kernel_core::error::{KernelError, KernelResult};
use kernel_core::plugin::{Plugin, PluginMetadata, RuntimeHandle};
use kernel_core::service_registry::ServiceHandler;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

tokio::task_local! {
    static OPERATION_ID: String;
}

/// Returns the operation id attached to the currently running task, if
/// any. Every log line and outbound HTTP call made while a request is
/// being handled picks this up so an admin UI can reconstruct one trace.
pub fn current_operation_id() -> Option<String> {
    OPERATION_ID.try_with(|id| id.clone()).ok()
}

/// Runs `f` with a fresh operation id attached — how a request enters
/// correlation in the first place. `incoming` lets the gateway honor an
/// `X-Request-ID` header instead of minting a new id.
pub async fn with_request_scope<F, Fut, T>(incoming: Option<String>, f: F) -> T
where
    F: FnOnce(String) -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let id = incoming.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    OPERATION_ID.scope(id.clone(), f(id)).await
}

/// Opens a new operation scope for background / scheduled work that is
/// not triggered by an HTTP request — device sync, token refresh, online
/// status polling. Emits `operation.start` and `operation.ok` /
/// `operation.error` around the body, the latter decided by the body's
/// own outcome.
pub async fn with_system_scope<F, Fut, T>(logger: Arc<RequestLogger>, name: &str, f: F) -> KernelResult<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = KernelResult<T>>,
{
    let id = uuid::Uuid::new_v4().to_string();
    let name = name.to_string();
    OPERATION_ID
        .scope(id.clone(), async move {
            logger.set_request_metadata(&id, json!({ "origin": "system", "name": name }), None);
            logger.log(&id, "info", "operation.start", json!({})).await;
            let result = f().await;
            match &result {
                Ok(_) => logger.log(&id, "info", "operation.ok", json!({})).await,
                Err(e) => logger.log(&id, "error", "operation.error", json!({ "error": e.to_string() })).await,
            }
            result
        })
        .await
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: String,
    pub message: String,
    pub context: Value,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct OperationRecord {
    pub logs: Vec<LogEntry>,
    pub request_meta: Option<Value>,
    pub response_meta: Option<Value>,
}

/// In-memory store of `operation_id → (bounded log list, request/response
/// metadata)` plus a FIFO queue bounding the total number of tracked
/// operations. Eviction is by operation, oldest first.
pub struct RequestLogger {
    operations: Mutex<HashMap<String, OperationRecord>>,
    queue: Mutex<VecDeque<String>>,
    capacity: usize,
}

const MAX_LOG_ENTRIES_PER_OPERATION: usize = 200;

impl RequestLogger {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self { operations: Mutex::new(HashMap::new()), queue: Mutex::new(VecDeque::new()), capacity })
    }

    fn ensure_tracked(&self, operation_id: &str) {
        let mut operations = self.operations.lock().unwrap();
        if operations.contains_key(operation_id) {
            return;
        }
        operations.insert(operation_id.to_string(), OperationRecord::default());
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(operation_id.to_string());
        if queue.len() > self.capacity {
            if let Some(oldest) = queue.pop_front() {
                operations.remove(&oldest);
            }
        }
    }

    pub async fn log(&self, operation_id: &str, level: &str, message: &str, context: Value) {
        self.ensure_tracked(operation_id);
        let mut operations = self.operations.lock().unwrap();
        if let Some(record) = operations.get_mut(operation_id) {
            record.logs.push(LogEntry { timestamp: chrono::Utc::now(), level: level.to_string(), message: message.to_string(), context });
            if record.logs.len() > MAX_LOG_ENTRIES_PER_OPERATION {
                record.logs.remove(0);
            }
        }
    }

    pub fn set_request_metadata(&self, operation_id: &str, request_meta: Value, response_meta: Option<Value>) {
        self.ensure_tracked(operation_id);
        let mut operations = self.operations.lock().unwrap();
        if let Some(record) = operations.get_mut(operation_id) {
            record.request_meta = Some(request_meta);
            if response_meta.is_some() {
                record.response_meta = response_meta;
            }
        }
    }

    pub fn list_requests(&self, limit: usize, offset: usize) -> Vec<String> {
        let queue = self.queue.lock().unwrap();
        queue.iter().rev().skip(offset).take(limit).cloned().collect()
    }

    pub fn get_request_logs(&self, operation_id: &str) -> Option<OperationRecord> {
        self.operations.lock().unwrap().get(operation_id).cloned()
    }
}

struct LogService(Arc<RequestLogger>);
#[async_trait]
impl ServiceHandler for LogService {
    async fn call(&self, args: Vec<Value>, kwargs: HashMap<String, Value>) -> KernelResult<Value> {
        let operation_id = args.first().and_then(|v| v.as_str()).ok_or_else(|| KernelError::InvalidInput("operation_id required".into()))?;
        let level = args.get(1).and_then(|v| v.as_str()).unwrap_or("info");
        let message = args.get(2).and_then(|v| v.as_str()).ok_or_else(|| KernelError::InvalidInput("message required".into()))?;
        self.0.log(operation_id, level, message, Value::Object(kwargs.into_iter().collect())).await;
        Ok(json!({ "ok": true }))
    }
}

struct SetMetadataService(Arc<RequestLogger>);
#[async_trait]
impl ServiceHandler for SetMetadataService {
    async fn call(&self, args: Vec<Value>, _kwargs: HashMap<String, Value>) -> KernelResult<Value> {
        let operation_id = args.first().and_then(|v| v.as_str()).ok_or_else(|| KernelError::InvalidInput("operation_id required".into()))?;
        let request_meta = args.get(1).cloned().unwrap_or(Value::Null);
        let response_meta = args.get(2).cloned();
        self.0.set_request_metadata(operation_id, request_meta, response_meta);
        Ok(json!({ "ok": true }))
    }
}

struct ListRequestsService(Arc<RequestLogger>);
#[async_trait]
impl ServiceHandler for ListRequestsService {
    async fn call(&self, args: Vec<Value>, _kwargs: HashMap<String, Value>) -> KernelResult<Value> {
        let limit = args.first().and_then(|v| v.as_u64()).unwrap_or(50) as usize;
        let offset = args.get(1).and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        Ok(json!(self.0.list_requests(limit, offset)))
    }
}

struct GetRequestLogsService(Arc<RequestLogger>);
#[async_trait]
impl ServiceHandler for GetRequestLogsService {
    async fn call(&self, args: Vec<Value>, _kwargs: HashMap<String, Value>) -> KernelResult<Value> {
        let operation_id = args.first().and_then(|v| v.as_str()).ok_or_else(|| KernelError::InvalidInput("operation_id required".into()))?;
        match self.0.get_request_logs(operation_id) {
            Some(record) => Ok(serde_json::to_value(record)?),
            None => Err(KernelError::NotFound(format!("operation {operation_id}"))),
        }
    }
}

pub struct RequestLoggerModule {
    logger: Arc<RequestLogger>,
}

impl RequestLoggerModule {
    pub fn new(logger: Arc<RequestLogger>) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl Plugin for RequestLoggerModule {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            name: "request_logger".into(),
            version: "1.0.0".into(),
            description: "Operation correlation and log retrieval".into(),
            author: "runtime-kernel".into(),
            dependencies: vec![],
        }
    }

    async fn on_load(&self, runtime: Arc<RuntimeHandle>) -> anyhow::Result<()> {
        let services = &runtime.service_registry;
        services.register("request_logger.log", Arc::new(LogService(Arc::clone(&self.logger))))?;
        services.register("request_logger.set_request_metadata", Arc::new(SetMetadataService(Arc::clone(&self.logger))))?;
        services.register("request_logger.list_requests", Arc::new(ListRequestsService(Arc::clone(&self.logger))))?;
        services.register("request_logger.get_request_logs", Arc::new(GetRequestLogsService(Arc::clone(&self.logger))))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_allocates_and_tracks_a_new_operation() {
        let logger = RequestLogger::new(10);
        logger.log("op1", "info", "hello", json!({})).await;
        let record = logger.get_request_logs("op1").unwrap();
        assert_eq!(record.logs.len(), 1);
        assert_eq!(record.logs[0].message, "hello");
    }

    #[tokio::test]
    async fn fifo_eviction_drops_oldest_operation_when_full() {
        let logger = RequestLogger::new(2);
        logger.log("op1", "info", "a", json!({})).await;
        logger.log("op2", "info", "b", json!({})).await;
        logger.log("op3", "info", "c", json!({})).await;
        assert!(logger.get_request_logs("op1").is_none());
        assert!(logger.get_request_logs("op3").is_some());
    }

    #[tokio::test]
    async fn current_operation_id_is_available_inside_request_scope() {
        let seen = with_request_scope(Some("fixed-id".to_string()), |id| async move {
            assert_eq!(id, "fixed-id");
            current_operation_id()
        })
        .await;
        assert_eq!(seen.as_deref(), Some("fixed-id"));
        assert!(current_operation_id().is_none());
    }

    #[tokio::test]
    async fn system_scope_logs_start_and_ok() {
        let logger = RequestLogger::new(10);
        with_system_scope(Arc::clone(&logger), "token_refresh", || async { Ok(()) })
            .await
            .unwrap();
        let operation_ids = logger.list_requests(10, 0);
        assert_eq!(operation_ids.len(), 1);
        let record = logger.get_request_logs(&operation_ids[0]).unwrap();
        assert_eq!(record.logs.len(), 2);
        assert_eq!(record.logs[0].message, "operation.start");
        assert_eq!(record.logs[1].message, "operation.ok");
    }

    #[tokio::test]
    async fn system_scope_logs_error_on_failure() {
        let logger = RequestLogger::new(10);
        let err = with_system_scope(Arc::clone(&logger), "token_refresh", || async {
            Err::<(), KernelError>(KernelError::Timeout)
        })
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), 504);
        let operation_ids = logger.list_requests(10, 0);
        let record = logger.get_request_logs(&operation_ids[0]).unwrap();
        assert_eq!(record.logs[1].message, "operation.error");
    }

    #[tokio::test]
    async fn list_requests_paginates_newest_first() {
        let logger = RequestLogger::new(10);
        logger.log("op1", "info", "a", json!({})).await;
        logger.log("op2", "info", "b", json!({})).await;
        assert_eq!(logger.list_requests(1, 0), vec!["op2".to_string()]);
    }
}
