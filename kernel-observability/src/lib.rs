pub mod http_client;
pub mod metrics;
pub mod request_logger;

pub use http_client::LoggedHttpClient;
pub use metrics::MetricsCollector;
pub use request_logger::{RequestLogger, RequestLoggerModule};
