use anyhow::{Context, Result};
use camjam_feed::api::{start_api_server, AppState};
use camjam_feed::{Config, ObjectLister, RefreshScheduler, S3Lister, SnapshotBuilder, SnapshotCache};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format)?;

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e).context("Invalid configuration");
    }

    info!(
        service = %config.service.name,
        bucket = %config.s3.bucket,
        port = %config.api.port,
        "Starting Camjam feed service"
    );

    // Initialize metrics
    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    // Initialize components
    let lister: Arc<dyn ObjectLister> = Arc::new(S3Lister::new(&config.s3).await);
    let builder = SnapshotBuilder::from_config(&config.snapshot, &config.s3);
    let cache = Arc::new(SnapshotCache::new());

    let scheduler = RefreshScheduler::new(lister, builder, cache.clone(), &config.refresh);

    let api_state = AppState {
        cache: cache.clone(),
        max_items: config.snapshot.max_items,
    };

    let cancel = CancellationToken::new();

    // Spawn refresh task
    let scheduler_handle = tokio::spawn(scheduler.run(cancel.clone()));

    // Spawn API server task
    let api_config = config.api.clone();
    let api_cancel = cancel.clone();
    let api_handle = tokio::spawn(async move {
        let shutdown = api_cancel.clone().cancelled_owned();
        let result = start_api_server(api_state, &api_config, shutdown).await;
        if let Err(ref e) = result {
            error!(error = ?e, "API server error");
            // Without a server there is nothing left to serve
            api_cancel.cancel();
        }
        result
    });

    info!("Feed service started successfully");

    // Wait for shutdown signal, or for the server to exit on its own
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = cancel.cancelled() => {}
    }

    info!("Shutting down feed service");

    cancel.cancel();

    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "Refresh task panicked");
    }
    let api_result = api_handle.await.context("API task panicked")?;

    info!("Feed service stopped");

    api_result
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Invalid log level")?;

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
