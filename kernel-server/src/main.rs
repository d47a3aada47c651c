use clap::Parser;
use kernel_admin::gateway::{build_router, GatewayState};
use kernel_admin::CoreRuntime;
use kernel_core::config::KernelConfig;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kernel-server", version, about = "Plugin-first runtime kernel")]
struct Cli {
    /// Override the configured bind address (host:port)
    #[arg(long)]
    bind_addr: Option<String>,

    /// Log level, used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = KernelConfig::load()?;
    init_tracing(&cli.log_level, &config.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), environment = %config.environment, "runtime kernel starting");

    let config = Arc::new(config);
    let storage_adapter = kernel_store::build_adapter(&config).await?;
    let runtime = Arc::new(CoreRuntime::new(storage_adapter, Arc::clone(&config)));

    runtime.start().await?;
    info!("runtime started");

    let metrics = Arc::new(kernel_observability::MetricsCollector::new()?);
    let gateway_state = GatewayState {
        runtime: Arc::clone(&runtime.runtime_handle),
        router: Arc::new(kernel_admin::GatewayRouter::new()),
        auth: Arc::clone(&runtime.auth),
        config: Arc::clone(&config),
        metrics,
    };

    let app = build_router(gateway_state).layer(TraceLayer::new_for_http());

    let bind_addr = cli
        .bind_addr
        .or_else(|| config.bind_addr.clone())
        .unwrap_or_else(|| "0.0.0.0:8080".to_string());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "gateway listening");

    let shutdown_runtime = Arc::clone(&runtime);
    let serve_result = axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Err(e) = serve_result {
        error!(error = %e, "server exited with error");
    }

    info!("shutdown signal handled, stopping runtime");
    if let Err(e) = shutdown_runtime.shutdown().await {
        error!(error = %e, "error during runtime shutdown");
    }
    info!("runtime kernel stopped");

    Ok(())
}

fn init_tracing(log_level: &str, log_format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
