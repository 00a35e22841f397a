// Syncer binary entry point: one full synchronization run

use anyhow::Result;
use common::calendar::{CalendarFetcher, CalendarSource};
use common::config::Settings;
use common::identity::IdentityCache;
use common::retry::{ExponentialBackoff, RetryStrategy};
use common::store;
use common::sync::{
    BatchWriter, JsonSeedFile, PipelineConfig, PipelineController, SeedSource, StoreSeedSource,
};
use common::telemetry;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    info!("Starting schedule syncer");

    settings.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    let store = store::connect(&settings.store).await.map_err(|e| {
        error!(error = %e, "Failed to initialize store");
        anyhow::anyhow!("Store initialization error: {}", e)
    })?;

    info!(backend = ?settings.store.backend, "Store initialized");

    let seeds: Arc<dyn SeedSource> = match settings.sync.seeds_path.as_deref() {
        Some(path) => {
            info!(path = path, "Using seed file");
            Arc::new(JsonSeedFile::new(path))
        }
        None => {
            info!("Re-synchronizing entities already in the store");
            Arc::new(StoreSeedSource::new(store.clone()))
        }
    };

    let retry: Arc<dyn RetryStrategy> = Arc::new(ExponentialBackoff::from_settings(&settings.retry));
    let fetcher: Arc<dyn CalendarSource> =
        Arc::new(CalendarFetcher::new(&settings.source, retry).map_err(|e| {
            error!(error = %e, "Failed to initialize calendar fetcher");
            anyhow::anyhow!("Fetcher initialization error: {}", e)
        })?);

    let config = PipelineConfig::from_settings(&settings.sync)?;
    let writer = BatchWriter::new(store.clone(), settings.sync.chunk_size);
    let mut controller = PipelineController::new(
        store,
        Arc::new(IdentityCache::new()),
        fetcher,
        seeds,
        writer,
        config,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Shutdown signal received, finishing in-flight fetches");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let result = controller.run(shutdown_rx).await;
    telemetry::shutdown_tracer();

    let summary = result.map_err(|e| {
        error!(error = %e, "Synchronization failed");
        anyhow::anyhow!("Synchronization error: {}", e)
    })?;

    for phase in &summary.phases {
        info!(
            phase = ?phase.phase,
            entities = phase.entities,
            success = phase.outcomes.success,
            not_found = phase.outcomes.not_found,
            empty = phase.outcomes.empty,
            error = phase.outcomes.error,
            sessions_extracted = phase.sessions_extracted,
            sessions_written = phase.sessions_written,
            write_conflicts = phase.write_conflicts,
            truncations = phase.truncations,
            "Phase summary"
        );
    }
    info!(
        interrupted = summary.interrupted,
        deferred_resolved = summary.deferred_resolved,
        deferred_remaining = summary.deferred_remaining,
        "Syncer finished"
    );

    Ok(())
}
