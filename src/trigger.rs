//! Periodic full product sync for the default shop.

use std::sync::Arc;

use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::error::SyncError;
use crate::models::EntityType;
use crate::repositories::SyncRunRepository;
use crate::scheduler::BatchScheduler;
use crate::vendor::VendorClient;

/// Actor recorded on runs started by [`PeriodicTrigger`].
pub const ACTOR_PERIODIC: &str = "periodic";

pub struct PeriodicTrigger {
    scheduler: Arc<BatchScheduler>,
    vendor: Arc<dyn VendorClient>,
    runs: SyncRunRepository,
    shop_id: String,
    interval: Duration,
}

impl PeriodicTrigger {
    pub fn new(
        scheduler: Arc<BatchScheduler>,
        vendor: Arc<dyn VendorClient>,
        runs: SyncRunRepository,
        shop_id: String,
        interval: Duration,
    ) -> Self {
        Self {
            scheduler,
            vendor,
            runs,
            shop_id,
            interval,
        }
    }

    #[instrument(skip_all, fields(shop_id = %self.shop_id))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Starting periodic sync trigger");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Periodic trigger shutdown requested");
                    break;
                }
                _ = sleep(self.interval) => {
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "Periodic sync tick failed");
                    }
                }
            }
        }
    }

    /// Starts a full product import unless one is still in flight or the
    /// host is throttled. Returns the new run id, if any.
    pub async fn tick(&self) -> Result<Option<String>, SyncError> {
        if self.scheduler.optimizer().should_throttle() {
            debug!("Skipping periodic sync while throttled");
            return Ok(None);
        }

        if let Some(active) = self
            .runs
            .find_active(&self.shop_id, EntityType::Product, ACTOR_PERIODIC)
            .await?
        {
            debug!(run_id = %active.id, "Previous periodic run still active");
            return Ok(None);
        }

        let ids = self
            .vendor
            .list_entity_ids(&self.shop_id, EntityType::Product)
            .await?;
        if ids.is_empty() {
            debug!("Vendor reports no products");
            return Ok(None);
        }

        let run_id = self
            .scheduler
            .schedule_import(&self.shop_id, EntityType::Product, &ids, ACTOR_PERIODIC)
            .await?;
        Ok(Some(run_id))
    }
}
