//! # printsync Entry Point
//!
//! Loads configuration, prepares the database and runs the HTTP server next
//! to the job runner and the optional periodic trigger.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use printsync::{
    catalog::MirrorCatalog,
    config::ConfigLoader,
    db, notify,
    optimizer::SystemLoadSampler,
    pipeline::{Collaborators, Pipeline},
    server::{AppState, run_server},
    telemetry,
    trigger::PeriodicTrigger,
    vendor::PrintifyClient,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigLoader::new().load()?;
    telemetry::init_tracing(&config)?;

    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "Configuration loaded");
    }

    let db = db::init_pool(&config).await?;
    db::migrate(&db).await?;
    db::health_check(&db).await?;

    let vendor = Arc::new(PrintifyClient::new(&config.vendor).context("vendor client setup")?);
    let notifier = notify::from_config(
        &config.notify,
        Duration::from_secs(config.vendor.timeout_seconds),
    )?;

    let pipeline = Pipeline::build(
        db.clone(),
        &config,
        Collaborators {
            vendor: vendor.clone(),
            catalog: Arc::new(MirrorCatalog::new(db.clone())),
            notifier,
            sampler: Arc::new(SystemLoadSampler::new(config.optimizer.memory_limit_mb)),
        },
    );

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(pipeline.runner.clone().run(shutdown.clone())));

    if config.trigger.full_sync_interval_seconds > 0 {
        match &config.vendor.default_shop_id {
            Some(shop_id) => {
                let trigger = PeriodicTrigger::new(
                    pipeline.scheduler.clone(),
                    vendor,
                    pipeline.stores.runs.clone(),
                    shop_id.clone(),
                    Duration::from_secs(config.trigger.full_sync_interval_seconds),
                );
                tasks.push(tokio::spawn(trigger.run(shutdown.clone())));
            }
            None => tracing::warn!("Periodic sync configured without a default shop id; disabled"),
        }
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
        signal_token.cancel();
    });

    let state = AppState {
        db,
        ingestor: pipeline.ingestor.clone(),
    };
    let served = run_server(&config, state, shutdown.clone()).await;
    shutdown.cancel();

    for task in tasks {
        if let Err(err) = task.await {
            tracing::error!(error = %err, "Background task panicked");
        }
    }

    served
}
