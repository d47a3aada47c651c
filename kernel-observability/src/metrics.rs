use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus collectors for the kernel itself — HTTP traffic, plugin
/// lifecycle events, and auth outcomes. Exposed as plain text via
/// `gather_text`; the admin gateway mounts it at `/metrics`.
pub struct MetricsCollector {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub http_request_duration: HistogramVec,
    pub active_connections: IntGauge,
    pub plugin_lifecycle_events: IntCounterVec,
    pub auth_attempts_total: IntCounterVec,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("runtime_http_requests_total", "Total HTTP requests").namespace("runtime"),
            &["route", "method", "status"],
        )?;
        let http_request_duration = HistogramVec::new(
            HistogramOpts::new("runtime_http_request_duration_seconds", "Request latency")
                .namespace("runtime")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["route"],
        )?;
        let active_connections = IntGauge::new("runtime_active_connections", "Number of active connections")?;
        let plugin_lifecycle_events = IntCounterVec::new(
            Opts::new("runtime_plugin_lifecycle_events_total", "Plugin lifecycle transitions").namespace("runtime"),
            &["plugin", "transition", "outcome"],
        )?;
        let auth_attempts_total = IntCounterVec::new(
            Opts::new("runtime_auth_attempts_total", "Authentication attempts by source and outcome").namespace("runtime"),
            &["source", "outcome"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(plugin_lifecycle_events.clone()))?;
        registry.register(Box::new(auth_attempts_total.clone()))?;

        Ok(Self { registry, http_requests_total, http_request_duration, active_connections, plugin_lifecycle_events, auth_attempts_total })
    }

    pub fn record_request(&self, route: &str, method: &str, status: u16, duration_secs: f64) {
        self.http_requests_total.with_label_values(&[route, method, &status.to_string()]).inc();
        self.http_request_duration.with_label_values(&[route]).observe(duration_secs);
    }

    pub fn record_plugin_transition(&self, plugin: &str, transition: &str, succeeded: bool) {
        self.plugin_lifecycle_events.with_label_values(&[plugin, transition, if succeeded { "ok" } else { "error" }]).inc();
    }

    pub fn record_auth_attempt(&self, source: &str, succeeded: bool) {
        self.auth_attempts_total.with_label_values(&[source, if succeeded { "ok" } else { "denied" }]).inc();
    }

    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("failed to construct metrics collector")
    }
}
