//! Telemetry Hub
//!
//! Entry point: serves the unified `/metrics` and `/health` surface until
//! SIGINT or SIGTERM, then shuts every registered service down.

use anyhow::Context;
use telemetry_hub::config::Config;
use telemetry_hub::observability::metrics::init_metrics_recorder;
use telemetry_hub::Orchestrator;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "telemetry_hub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Telemetry Hub");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        environment = %config.environment,
        instance_id = %config.instance_id,
        health_poll_interval_secs = config.health_poll_interval.as_secs(),
        auto_discovery = config.auto_discovery,
        bridge_enabled = config.bridge.is_some(),
        "Configuration loaded successfully"
    );

    // Self-metrics are optional; the hub still serves every service without them
    let process_metrics = match init_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Failed to install metrics recorder: {}", e);
            None
        }
    };

    let orchestrator = Orchestrator::new(config, process_metrics);
    let address = orchestrator
        .initialize()
        .await
        .context("failed to initialize telemetry hub")?;

    info!("Telemetry Hub listening on {}", address);

    shutdown_signal().await;

    let report = orchestrator
        .shutdown()
        .await
        .context("failed to shut down telemetry hub")?;

    if report.timed_out {
        warn!(
            services = report.services,
            "Telemetry Hub shutdown complete, some services did not stop in time"
        );
    } else {
        info!(services = report.services, "Telemetry Hub shutdown complete");
    }

    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
