//! Wiring of the sync components around one database connection.

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::catalog::LocalCatalog;
use crate::config::AppConfig;
use crate::job_runner::JobRunner;
use crate::notify::Notifier;
use crate::optimizer::{ImportOptimizer, LoadSampler};
use crate::scheduler::{BatchScheduler, SyncStores};
use crate::vendor::VendorClient;
use crate::webhooks::WebhookIngestor;
use crate::worker::SyncWorker;

/// External collaborators the pipeline is built around.
pub struct Collaborators {
    pub vendor: Arc<dyn VendorClient>,
    pub catalog: Arc<dyn LocalCatalog>,
    pub notifier: Arc<dyn Notifier>,
    pub sampler: Arc<dyn LoadSampler>,
}

#[derive(Clone)]
pub struct Pipeline {
    pub stores: SyncStores,
    pub scheduler: Arc<BatchScheduler>,
    pub worker: Arc<SyncWorker>,
    pub ingestor: Arc<WebhookIngestor>,
    pub runner: JobRunner,
}

impl Pipeline {
    pub fn build(db: DatabaseConnection, config: &AppConfig, parts: Collaborators) -> Self {
        let stores = SyncStores::new(db);

        let optimizer = Arc::new(ImportOptimizer::new(
            stores.batches.clone(),
            stores.tracking.clone(),
            parts.sampler,
            config.optimizer.clone(),
            config.sync.clone(),
        ));
        let scheduler = Arc::new(BatchScheduler::new(
            stores.clone(),
            optimizer,
            parts.notifier,
            config.sync.clone(),
        ));
        let worker = Arc::new(SyncWorker::new(
            stores.clone(),
            scheduler.clone(),
            parts.vendor,
            parts.catalog.clone(),
            config.sync.clone(),
        ));
        let ingestor = Arc::new(WebhookIngestor::new(
            scheduler.clone(),
            parts.catalog,
            config.webhook.secret.clone(),
            config.vendor.default_shop_id.clone(),
        ));
        let runner = JobRunner::new(
            stores.jobs.clone(),
            stores.tracking.clone(),
            worker.clone(),
            config.runner.clone(),
            config.sync.clone(),
        );

        Self {
            stores,
            scheduler,
            worker,
            ingestor,
            runner,
        }
    }
}
