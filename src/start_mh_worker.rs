//! Startup helpers for the ingestion worker binary.

use std::process::ExitCode;

use anyhow::Context;

use crate::worker::{IngestConfig, IngestEngine, RunSummary, wait_for_signal};

/// Run the worker until a termination signal or end of input.
///
/// # Returns
/// `ExitCode::SUCCESS` after a clean drain, `1` on startup failure or when
/// records were left undrained.
#[must_use]
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting mh-worker v{}", env!("CARGO_PKG_VERSION"));

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match rt.block_on(run_worker()) {
        Ok(summary) if summary.shutdown.undrained == 0 => ExitCode::SUCCESS,
        Ok(summary) => {
            tracing::error!(
                undrained = summary.shutdown.undrained,
                "Worker stopped with undrained records"
            );
            ExitCode::from(1)
        }
        Err(e) => {
            tracing::error!("Worker failed: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// Load configuration, build the engine and run it against process signals.
///
/// # Errors
/// Returns an error if configuration is invalid or a backend cannot be built.
pub async fn run_worker() -> anyhow::Result<RunSummary> {
    let config = IngestConfig::from_env().context("invalid worker configuration")?;
    tracing::info!(
        source = ?config.stream.source,
        sink = ?config.sink.kind,
        table = %config.sink.table,
        "Configuration loaded"
    );

    let engine = IngestEngine::from_config(config)
        .await
        .context("failed to initialize ingestion engine")?;

    Ok(engine.run(shutdown_signal()).await)
}

/// Resolve on the first termination signal.
async fn shutdown_signal() {
    match wait_for_signal().await {
        Ok(signal) => tracing::info!(signal, "Termination signal received"),
        Err(e) => {
            tracing::error!("Failed to install signal handlers: {e}");
            std::future::pending::<()>().await;
        }
    }
}
