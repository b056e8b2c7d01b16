//! # Sync Worker
//!
//! Executes one batch: fetches every entity from the vendor, applies it to
//! the local catalog and records the outcome per entity. Transient failures
//! are handed back to the scheduler as retry batches, permanent ones fail the
//! entity, and a critical one pauses the whole run. A failure of the batch
//! bookkeeping itself is treated as critical too.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::LocalCatalog;
use crate::config::SyncConfig;
use crate::error::{ErrorClass, SyncError, SyncErrorKind};
use crate::models::scheduled_job::PROCESS_BATCH;
use crate::models::{BatchStatus, EntityType, RunStatus, TrackingStatus, sync_batch, sync_run};
use crate::repositories::EntityKey;
use crate::scheduler::{BatchScheduler, SyncStores, due_after};
use crate::vendor::VendorClient;

/// How a `process_batch` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchOutcome {
    /// No such batch
    #[default]
    Missing,
    /// Batch was already completed or cancelled
    AlreadyFinished,
    /// The run is no longer accepting work; the batch was cancelled
    RunInactive,
    /// Host under pressure; the batch was pushed back
    Deferred,
    /// Every entity was attempted
    Processed,
    /// A critical failure paused the run
    Paused,
}

/// Per-entity tallies for one batch execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchReport {
    pub outcome: BatchOutcome,
    pub completed: u32,
    pub skipped: u32,
    pub retrying: u32,
    pub failed: u32,
}

impl BatchReport {
    fn finished(outcome: BatchOutcome) -> Self {
        Self {
            outcome,
            ..Self::default()
        }
    }
}

enum EntityOutcome {
    Completed,
    Skipped,
    Retrying,
    Failed,
    Critical(SyncError),
}

impl EntityOutcome {
    fn label(&self) -> &'static str {
        match self {
            EntityOutcome::Completed => "completed",
            EntityOutcome::Skipped => "skipped",
            EntityOutcome::Retrying => "retrying",
            EntityOutcome::Failed => "failed",
            EntityOutcome::Critical(_) => "critical",
        }
    }
}

pub struct SyncWorker {
    stores: SyncStores,
    scheduler: Arc<BatchScheduler>,
    vendor: Arc<dyn VendorClient>,
    catalog: Arc<dyn LocalCatalog>,
    config: SyncConfig,
}

impl SyncWorker {
    pub fn new(
        stores: SyncStores,
        scheduler: Arc<BatchScheduler>,
        vendor: Arc<dyn VendorClient>,
        catalog: Arc<dyn LocalCatalog>,
        config: SyncConfig,
    ) -> Self {
        Self {
            stores,
            scheduler,
            vendor,
            catalog,
            config,
        }
    }

    /// Processes the batch stored under `batch_id`.
    ///
    /// Safe to call repeatedly: completed entities are skipped and finished
    /// batches are left untouched.
    ///
    /// Errors outside the per-entity handling pause the run. `Err` is only
    /// returned when the batch cannot be loaded or the pause itself fails.
    #[instrument(skip(self), fields(run_id))]
    pub async fn process_batch(&self, batch_id: &str) -> Result<BatchReport, SyncError> {
        let started = Instant::now();

        let Some(batch) = self.stores.batches.find(batch_id).await? else {
            warn!(batch_id = %batch_id, "Batch not found, nothing to do");
            return Ok(BatchReport::finished(BatchOutcome::Missing));
        };
        tracing::Span::current().record("run_id", batch.run_id.as_str());

        let result = match self.run_batch(&batch).await {
            Ok(report) => Ok(report),
            Err(err) => self.escalate(&batch, err).await,
        };
        record_duration(started);
        result
    }

    async fn run_batch(&self, batch: &sync_batch::Model) -> Result<BatchReport, SyncError> {
        let batch_id = batch.id.as_str();

        if matches!(
            batch.batch_status()?,
            BatchStatus::Completed | BatchStatus::Cancelled
        ) {
            debug!(batch_id = %batch_id, status = %batch.status, "Batch already finished");
            return Ok(BatchReport::finished(BatchOutcome::AlreadyFinished));
        }

        let run = match self.stores.runs.find(&batch.run_id).await? {
            Some(run) if run.run_status().is_ok_and(|status| !status.is_terminal()) => run,
            other => {
                info!(
                    batch_id = %batch_id,
                    run_status = other.as_ref().map(|run| run.status.as_str()).unwrap_or("missing"),
                    "Run no longer active, cancelling batch"
                );
                self.stores
                    .batches
                    .set_status(batch_id, BatchStatus::Cancelled)
                    .await?;
                return Ok(BatchReport::finished(BatchOutcome::RunInactive));
            }
        };

        if self.scheduler.optimizer().should_throttle() {
            self.defer(batch).await?;
            return Ok(BatchReport::finished(BatchOutcome::Deferred));
        }

        match self
            .stores
            .runs
            .transition(&run.id, RunStatus::Running, None)
            .await
        {
            Ok(_) => {}
            Err(err) if matches!(err.kind, SyncErrorKind::InvalidTransition { .. }) => {
                // Paused or finished between the read above and now.
                self.stores
                    .batches
                    .set_status(batch_id, BatchStatus::Cancelled)
                    .await?;
                return Ok(BatchReport::finished(BatchOutcome::RunInactive));
            }
            Err(err) => return Err(err),
        }
        self.stores
            .batches
            .set_status(batch_id, BatchStatus::Processing)
            .await?;

        let entity_type: EntityType = run.entity_type.parse()?;
        let mut report = BatchReport::finished(BatchOutcome::Processed);

        for remote_id in batch.entity_id_list() {
            let key = EntityKey::new(entity_type, &run.shop_id, &remote_id);

            let outcome = match self.process_entity(&run, &key).await {
                Ok(outcome) => outcome,
                // The tracking store itself failed.
                Err(store_error) => EntityOutcome::Critical(store_error),
            };
            counter!("sync_entities_total", "outcome" => outcome.label()).increment(1);

            match outcome {
                EntityOutcome::Completed => report.completed += 1,
                EntityOutcome::Skipped => report.skipped += 1,
                EntityOutcome::Retrying => report.retrying += 1,
                EntityOutcome::Failed => report.failed += 1,
                EntityOutcome::Critical(err) => {
                    error!(
                        batch_id = %batch_id,
                        remote_id = %remote_id,
                        error = %err,
                        "Critical failure, pausing run"
                    );
                    self.scheduler.pause_run(&run.id, &err.to_string()).await?;
                    report.outcome = BatchOutcome::Paused;
                    return Ok(report);
                }
            }
        }

        self.stores
            .batches
            .set_status(batch_id, BatchStatus::Completed)
            .await?;
        self.finalize_run(&run.id).await?;

        info!(
            batch_id = %batch_id,
            completed = report.completed,
            skipped = report.skipped,
            retrying = report.retrying,
            failed = report.failed,
            "Batch processed"
        );

        Ok(report)
    }

    /// Pauses the batch's run after a batch-level failure. The original
    /// error is returned if the pause cannot be recorded, so the job is
    /// tried again.
    async fn escalate(
        &self,
        batch: &sync_batch::Model,
        err: SyncError,
    ) -> Result<BatchReport, SyncError> {
        error!(
            batch_id = %batch.id,
            run_id = %batch.run_id,
            error = %err,
            "Batch-level failure, pausing run"
        );
        counter!("sync_batch_escalations_total").increment(1);

        match self.scheduler.pause_run(&batch.run_id, &err.to_string()).await {
            Ok(_) => Ok(BatchReport::finished(BatchOutcome::Paused)),
            Err(pause_err) => {
                error!(
                    batch_id = %batch.id,
                    run_id = %batch.run_id,
                    error = %pause_err,
                    "Could not pause run after batch-level failure"
                );
                Err(err)
            }
        }
    }

    /// Runs one entity through fetch and apply. Only tracking-store errors
    /// are returned as `Err`.
    async fn process_entity(
        &self,
        run: &sync_run::Model,
        key: &EntityKey,
    ) -> Result<EntityOutcome, SyncError> {
        if let Some(record) = self.stores.tracking.find(key).await?
            && record.tracking_status()? == TrackingStatus::Completed
        {
            return Ok(EntityOutcome::Skipped);
        }

        if !self.stores.tracking.claim_processing(key, &run.id).await? {
            debug!(remote_id = %key.remote_id, "Entity owned elsewhere or already done");
            return Ok(EntityOutcome::Skipped);
        }

        let error = match self.sync_entity(key).await {
            Ok(local_id) => {
                self.stores
                    .tracking
                    .mark_completed(key, &run.id, &local_id)
                    .await?;
                return Ok(EntityOutcome::Completed);
            }
            Err(error) => error,
        };

        let message = error.to_string();
        match error.class() {
            ErrorClass::Transient => {
                let outcome = self
                    .stores
                    .tracking
                    .record_failure(key, &run.id, &message, self.config.max_retries)
                    .await?;

                match outcome {
                    Some(outcome) if outcome.will_retry => {
                        let record = self.stores.tracking.find(key).await?.ok_or_else(|| {
                            SyncError::critical("tracking record vanished before retry")
                        })?;
                        self.scheduler
                            .schedule_retry(run, &record, error.retry_after_secs())
                            .await?;
                        warn!(
                            remote_id = %key.remote_id,
                            attempts = outcome.attempts,
                            error = %message,
                            "Transient failure, retry scheduled"
                        );
                        Ok(EntityOutcome::Retrying)
                    }
                    Some(outcome) => {
                        warn!(
                            remote_id = %key.remote_id,
                            attempts = outcome.attempts,
                            error = %message,
                            "Retries exhausted, entity failed"
                        );
                        Ok(EntityOutcome::Failed)
                    }
                    None => Ok(EntityOutcome::Skipped),
                }
            }
            ErrorClass::Permanent => {
                self.stores
                    .tracking
                    .mark_failed(key, &run.id, &message)
                    .await?;
                warn!(remote_id = %key.remote_id, error = %message, "Entity failed permanently");
                Ok(EntityOutcome::Failed)
            }
            ErrorClass::Critical => {
                self.stores
                    .tracking
                    .mark_pending_with_error(key, &run.id, &message)
                    .await?;
                Ok(EntityOutcome::Critical(error))
            }
        }
    }

    async fn sync_entity(&self, key: &EntityKey) -> Result<String, SyncError> {
        let timeout = StdDuration::from_secs(self.config.fetch_timeout_seconds);
        let payload = tokio::time::timeout(
            timeout,
            self.vendor
                .fetch_entity(&key.shop_id, key.entity_type, &key.remote_id),
        )
        .await
        .map_err(|_| {
            SyncError::transient(format!(
                "vendor call timed out after {}s",
                timeout.as_secs()
            ))
        })??;

        Ok(self
            .catalog
            .apply(&key.shop_id, key.entity_type, &key.remote_id, &payload)
            .await?)
    }

    async fn defer(&self, batch: &sync_batch::Model) -> Result<(), SyncError> {
        let until = due_after(Utc::now(), self.config.throttle_delay_seconds)?.fixed_offset();
        self.stores.batches.defer(&batch.id, until).await?;
        self.stores
            .jobs
            .enqueue(
                PROCESS_BATCH,
                &batch.run_id,
                json!({ "batch_id": batch.id }),
                until,
            )
            .await?;
        info!(batch_id = %batch.id, until = %until, "Batch deferred under load");
        Ok(())
    }

    /// Closes the run once nothing is left to do for it.
    ///
    /// The run completes if at least one entity completed and fails otherwise.
    async fn finalize_run(&self, run_id: &str) -> Result<Option<RunStatus>, SyncError> {
        let open_batches = self.stores.batches.count_open_for_run(run_id, None).await?;
        let unfinished = self
            .stores
            .tracking
            .count_for_run(
                run_id,
                &[TrackingStatus::Pending, TrackingStatus::Processing],
            )
            .await?;
        if open_batches > 0 || unfinished > 0 {
            return Ok(None);
        }

        let completed = self
            .stores
            .tracking
            .count_for_run(run_id, &[TrackingStatus::Completed])
            .await?;
        let status = if completed > 0 {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        match self.stores.runs.transition(run_id, status, None).await {
            Ok(_) => {
                info!(run_id = %run_id, status = %status, completed, "Sync run finished");
                Ok(Some(status))
            }
            Err(err) if matches!(err.kind, SyncErrorKind::InvalidTransition { .. }) => {
                debug!(run_id = %run_id, error = %err, "Run already closed elsewhere");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

fn record_duration(started: Instant) {
    histogram!("sync_batch_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
}
