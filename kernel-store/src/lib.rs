pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use memory::InMemoryAdapter;
pub use postgres::PostgresAdapter;
pub use sqlite::SqliteAdapter;

use kernel_core::config::KernelConfig;
use kernel_core::error::{KernelError, KernelResult};
use kernel_core::storage::StorageAdapter;
use std::sync::Arc;

/// Constructs the configured `StorageAdapter` implementation.
pub async fn build_adapter(config: &KernelConfig) -> KernelResult<Arc<dyn StorageAdapter>> {
    match config.storage.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryAdapter::new())),
        "sqlite" => Ok(Arc::new(SqliteAdapter::connect(&config.storage.dsn).await?)),
        "postgres" => Ok(Arc::new(PostgresAdapter::connect(&config.storage.dsn).await?)),
        other => Err(KernelError::InvalidInput(format!("unknown storage backend {other}"))),
    }
}
