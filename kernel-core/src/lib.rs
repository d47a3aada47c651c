pub mod config;
pub mod error;
pub mod event_bus;
pub mod http_registry;
pub mod plugin;
pub mod request_context;
pub mod service_registry;
pub mod state_engine;
pub mod storage;
pub mod storage_mirror;
