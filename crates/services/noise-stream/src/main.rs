//! Noise Stream Binary
//!
//! Entry point for the noise stream service.

use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use noise_stream::{
    api::{build_router, AppState},
    config::{Config, LogFormat, LoggingConfig, CONFIG_PATH_ENV},
    encoder::FfmpegLauncher,
    registry::StreamRegistry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::var(CONFIG_PATH_ENV).ok();
    let config = Config::load(config_path.as_deref())?;

    init_tracing(&config.logging);

    tracing::info!("Starting Noise Stream...");
    config.validate()?;
    let config = Arc::new(config);

    tracing::info!(
        "Configuration: HTTP port={}, hls_dir={}, noise_types={:?}",
        config.server.port,
        config.channels.hls_dir.display(),
        config.channels.noise_types
    );

    let launcher = Arc::new(FfmpegLauncher::new(config.encoder.program.clone()));
    let registry = Arc::new(StreamRegistry::from_config(&config, launcher).await?);

    // Auto-start every channel; failures keep retrying in the background
    let reports = registry.start_all().await;
    let started = reports.iter().filter(|r| r.started).count();
    tracing::info!(
        "Auto-started noise streams: started={}, failed={}, total={}",
        started,
        reports.len() - started,
        reports.len()
    );

    // Create app state and router
    let state = AppState::new(registry.clone(), config.clone());
    let router = build_router(state);

    // Start HTTP server
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("HTTP server listening on {}", bind_addr);

    // Run the HTTP server with graceful shutdown on SIGTERM/SIGINT
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, initiating graceful shutdown...");
        })
        .await?;

    registry
        .shutdown(config.supervisor.shutdown_timeout())
        .await;

    tracing::info!("Noise Stream shutdown complete");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("{},tower_http=debug", logging.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
