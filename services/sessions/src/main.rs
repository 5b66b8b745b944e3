use anyhow::{Context, Result};
use session_service::api::{start_api_server, AppState};
use session_service::{
    Config, PgSessionStore, RetentionSweeper, S3BlobStore, SessionService, UploadPolicy,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Emo Now session service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let session_store = Arc::new(
        PgSessionStore::new(&config.database)
            .await
            .context("Failed to initialize session store")?,
    );

    if config.database.run_migrations {
        session_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blob_store = Arc::new(
        S3BlobStore::new(&config.blob_store)
            .await
            .context("Failed to initialize blob store")?,
    );

    let service = SessionService::new(
        session_store.clone(),
        blob_store.clone(),
        UploadPolicy::from(&config.uploads),
    );

    let sweeper_handle = if config.retention.enabled {
        let sweeper = RetentionSweeper::new(
            session_store.clone(),
            blob_store.clone(),
            config.retention_window(),
            config.sweep_interval(),
        );
        Some(sweeper.spawn())
    } else {
        warn!("Retention sweeper disabled");
        None
    };

    info!("Session service started successfully");

    if let Err(e) = start_api_server(AppState { service }, &config.api, shutdown_signal()).await {
        error!(error = %e, "API server error");
    }

    info!("Shutting down session service");

    if let Some(handle) = sweeper_handle {
        handle.abort();
    }
    session_store.close().await;

    info!("Session service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
