//! # Batch Scheduler
//!
//! Turns import requests and webhook events into sync runs: one `sync_runs`
//! row, its `sync_batches` chunks, a tracking record per entity and the
//! deferred jobs that will hand each batch to the worker. Also owns the run
//! lifecycle operations that cut across batches (retry, pause, resume).

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use metrics::counter;
use sea_orm::{ConnectionTrait, DatabaseConnection, TransactionTrait};
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::scheduled_job::{CLEANUP_RUN, PROCESS_BATCH};
use crate::models::sync_batch::{import_batch_id, retry_batch_id};
use crate::models::{BatchKind, EntityType, RunStatus, TrackingStatus, sync_run, sync_tracking};
use crate::notify::{Notifier, OperatorAlert};
use crate::optimizer::ImportOptimizer;
use crate::repositories::sync_batch::NewBatch;
use crate::repositories::sync_run::NewRun;
use crate::repositories::{
    ScheduledJobRepository, SyncBatchRepository, SyncRunRepository, SyncTrackingRepository,
};

/// Actor recorded on runs created from webhook events.
pub const ACTOR_WEBHOOK: &str = "webhook";
/// Actor recorded on child runs created by [`BatchScheduler::resume_import`].
pub const ACTOR_RESUME: &str = "resume";

/// Repositories the scheduler and worker share, plus the connection they
/// are built on for multi-table transactions.
#[derive(Clone)]
pub struct SyncStores {
    pub db: DatabaseConnection,
    pub runs: SyncRunRepository,
    pub batches: SyncBatchRepository,
    pub tracking: SyncTrackingRepository,
    pub jobs: ScheduledJobRepository,
}

impl SyncStores {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            runs: SyncRunRepository::new(db.clone()),
            batches: SyncBatchRepository::new(db.clone()),
            tracking: SyncTrackingRepository::new(db.clone()),
            jobs: ScheduledJobRepository::new(db.clone()),
            db,
        }
    }
}

/// Everything needed to lay a run out as batches.
struct RunPlan<'a> {
    shop_id: &'a str,
    entity_type: EntityType,
    entity_ids: Vec<String>,
    initiated_by: &'a str,
    parent_run_id: Option<String>,
    kind: BatchKind,
    chunk_size: usize,
    base_delay: Duration,
}

/// What `pause_run` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseReport {
    pub run_id: String,
    pub unscheduled_jobs: u64,
    pub cancelled_batches: u64,
    /// Entities of the run not yet completed or failed
    pub affected: u64,
}

pub struct BatchScheduler {
    stores: SyncStores,
    optimizer: Arc<ImportOptimizer>,
    notifier: Arc<dyn Notifier>,
    config: SyncConfig,
}

impl BatchScheduler {
    pub fn new(
        stores: SyncStores,
        optimizer: Arc<ImportOptimizer>,
        notifier: Arc<dyn Notifier>,
        config: SyncConfig,
    ) -> Self {
        Self {
            stores,
            optimizer,
            notifier,
            config,
        }
    }

    pub fn optimizer(&self) -> &ImportOptimizer {
        &self.optimizer
    }

    /// Schedules a chunked import of `entity_ids` and returns the new run id.
    ///
    /// Duplicate and blank ids are dropped (first occurrence wins) before the
    /// run is created. Chunk `i` is due `i * stagger_interval` after the base
    /// time, which is pushed back by the throttle delay when the host is
    /// under pressure.
    #[instrument(skip(self, entity_ids), fields(requested = entity_ids.len()))]
    pub async fn schedule_import(
        &self,
        shop_id: &str,
        entity_type: EntityType,
        entity_ids: &[String],
        initiated_by: &str,
    ) -> Result<String, SyncError> {
        if shop_id.trim().is_empty() {
            return Err(SyncError::invalid_input("shop id must not be blank"));
        }
        let entity_ids = unique_ids(entity_ids);
        if entity_ids.is_empty() {
            return Err(SyncError::invalid_input(
                "at least one entity id is required",
            ));
        }

        let chunk_size = self.optimizer.optimize_batch_size(None).await?;

        self.schedule_run(RunPlan {
            shop_id,
            entity_type,
            entity_ids,
            initiated_by,
            parent_run_id: None,
            kind: BatchKind::Import,
            chunk_size,
            base_delay: Duration::zero(),
        })
        .await
    }

    /// Schedules a one-entity run for a webhook event after the settle delay
    /// for the event's family.
    #[instrument(skip(self))]
    pub async fn schedule_webhook_update(
        &self,
        remote_id: &str,
        shop_id: &str,
        entity_type: EntityType,
        event_type: &str,
    ) -> Result<String, SyncError> {
        if remote_id.trim().is_empty() || shop_id.trim().is_empty() {
            return Err(SyncError::invalid_input(
                "webhook update needs an entity id and a shop id",
            ));
        }

        let settle = self.settle_delay(event_type);

        self.schedule_run(RunPlan {
            shop_id,
            entity_type,
            entity_ids: vec![remote_id.trim().to_string()],
            initiated_by: ACTOR_WEBHOOK,
            parent_run_id: None,
            kind: BatchKind::Webhook,
            chunk_size: 1,
            base_delay: settle,
        })
        .await
    }

    /// Settle delay applied before fetching an entity named by `event_type`.
    pub fn settle_delay(&self, event_type: &str) -> Duration {
        let seconds = if event_type.starts_with("product.") {
            self.config.product_settle_seconds
        } else if event_type.starts_with("order.") {
            self.config.order_settle_seconds
        } else {
            0
        };
        Duration::seconds(seconds as i64)
    }

    /// Schedules a single-entity retry batch for `record` within `run`.
    ///
    /// The batch is due after the retry delay, or after the vendor's
    /// `Retry-After` when that is longer. `Retry-After` is capped at
    /// `max_retry_after_seconds`. Returns the batch id.
    #[instrument(skip(self, run, record), fields(run_id = %run.id, remote_id = %record.remote_id))]
    pub async fn schedule_retry(
        &self,
        run: &sync_run::Model,
        record: &sync_tracking::Model,
        retry_after_secs: Option<u64>,
    ) -> Result<String, SyncError> {
        let delay_secs = retry_delay_secs(
            retry_after_secs,
            self.config.retry_delay_seconds,
            self.config.max_retry_after_seconds,
        );
        if retry_after_secs.is_some_and(|after| after > delay_secs) {
            warn!(
                retry_after = retry_after_secs,
                capped_to = delay_secs,
                "Vendor Retry-After exceeds the cap"
            );
        }
        let due = due_after(Utc::now(), delay_secs)?.fixed_offset();
        let batch_id = retry_batch_id(&run.id, &record.remote_id, record.attempts);

        let txn = self.stores.db.begin().await?;
        let batch = self
            .stores
            .batches
            .create_in(&txn, NewBatch {
                id: batch_id,
                run_id: run.id.clone(),
                seq: record.attempts.max(0) as usize,
                kind: BatchKind::Retry,
                entity_ids: vec![record.remote_id.clone()],
                chunk_size: 1,
                scheduled_at: due,
            })
            .await?;
        self.enqueue_batch(&txn, &run.id, &batch.id, due).await?;
        txn.commit().await?;

        counter!("sync_batches_scheduled_total", "kind" => BatchKind::Retry.as_str()).increment(1);
        info!(
            batch_id = %batch.id,
            attempts = record.attempts,
            due_at = %due,
            "Retry scheduled"
        );

        Ok(batch.id)
    }

    /// Stops a run after a critical failure.
    ///
    /// Queued batch jobs of the run are unscheduled, open batches are
    /// cancelled, the run moves to `paused` with the error and the operator
    /// is told. The run's cleanup job stays queued. Notification failures
    /// are logged and do not undo the pause.
    #[instrument(skip(self, error_message))]
    pub async fn pause_run(
        &self,
        run_id: &str,
        error_message: &str,
    ) -> Result<PauseReport, SyncError> {
        let unscheduled_jobs = self
            .stores
            .jobs
            .unschedule_group(run_id, PROCESS_BATCH)
            .await?;
        let cancelled_batches = self.stores.batches.cancel_open_for_run(run_id).await?;
        self.stores
            .runs
            .transition(run_id, RunStatus::Paused, Some(error_message))
            .await?;

        let affected = self
            .stores
            .tracking
            .count_for_run(
                run_id,
                &[TrackingStatus::Pending, TrackingStatus::Processing],
            )
            .await?;

        counter!("sync_runs_paused_total").increment(1);
        warn!(
            run_id = %run_id,
            unscheduled_jobs,
            cancelled_batches,
            affected,
            error = %error_message,
            "Sync run paused"
        );

        let alert = OperatorAlert::run_paused(run_id, error_message, affected);
        if let Err(err) = self.notifier.notify(&alert).await {
            error!(run_id = %run_id, error = %err, "Failed to notify operator of paused run");
        }

        Ok(PauseReport {
            run_id: run_id.to_string(),
            unscheduled_jobs,
            cancelled_batches,
            affected,
        })
    }

    /// Re-schedules the unfinished entities of a paused run as a child run.
    ///
    /// The paused run itself keeps its status.
    #[instrument(skip(self))]
    pub async fn resume_import(&self, run_id: &str) -> Result<String, SyncError> {
        let run = self
            .stores
            .runs
            .find(run_id)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("sync run {run_id}")))?;

        let status = run.run_status()?;
        if status != RunStatus::Paused {
            return Err(SyncError::invalid_transition(
                status.as_str(),
                "resumed",
            ));
        }

        let remaining: Vec<String> = self
            .stores
            .tracking
            .list_for_run(
                run_id,
                &[
                    TrackingStatus::Pending,
                    TrackingStatus::Processing,
                    TrackingStatus::Failed,
                ],
            )
            .await?
            .into_iter()
            .map(|record| record.remote_id)
            .collect();

        if remaining.is_empty() {
            return Err(SyncError::invalid_input(format!(
                "run {run_id} has no unfinished entities to resume"
            )));
        }

        let entity_type: EntityType = run.entity_type.parse()?;
        let chunk_size = self.optimizer.optimize_batch_size(Some(run_id)).await?;

        let child_id = self
            .schedule_run(RunPlan {
                shop_id: &run.shop_id,
                entity_type,
                entity_ids: remaining,
                initiated_by: ACTOR_RESUME,
                parent_run_id: Some(run.id.clone()),
                kind: BatchKind::Import,
                chunk_size,
                base_delay: Duration::zero(),
            })
            .await?;

        info!(
            run_id = %run_id,
            child_run_id = %child_id,
            "Paused run resumed as child run"
        );

        Ok(child_id)
    }

    /// Writes the run, its tracking records, batches and jobs in one
    /// transaction: either every id is covered by a batch or nothing exists.
    async fn schedule_run(&self, plan: RunPlan<'_>) -> Result<String, SyncError> {
        let now = Utc::now();
        let mut base = now + plan.base_delay;
        if self.optimizer.should_throttle() {
            base = due_after(base, self.config.throttle_delay_seconds)?;
        }

        let chunk_size = plan
            .chunk_size
            .clamp(1, self.config.max_chunk.max(1));
        let run_id = SyncRunRepository::next_run_id();
        let stagger = Duration::try_seconds(self.config.stagger_interval_seconds as i64)
            .ok_or_else(|| SyncError::invalid_input("stagger interval out of range"))?;
        let cleanup_at = due_after(now, self.config.cleanup_delay_seconds)?.fixed_offset();

        let txn = self.stores.db.begin().await?;

        self.stores
            .runs
            .create_in(&txn, NewRun {
                id: run_id.clone(),
                shop_id: plan.shop_id.to_string(),
                entity_type: plan.entity_type,
                total_items: plan.entity_ids.len(),
                initiated_by: plan.initiated_by.to_string(),
                parent_run_id: plan.parent_run_id,
            })
            .await?;

        self.stores
            .tracking
            .assign_to_run_in(&txn, plan.entity_type, plan.shop_id, &plan.entity_ids, &run_id)
            .await?;

        let mut scheduled = 0usize;

        for (index, chunk) in plan.entity_ids.chunks(chunk_size).enumerate() {
            let due = batch_due_at(base, stagger, index);
            let batch = self
                .stores
                .batches
                .create_in(&txn, NewBatch {
                    id: import_batch_id(&run_id, index),
                    run_id: run_id.clone(),
                    seq: index,
                    kind: plan.kind,
                    entity_ids: chunk.to_vec(),
                    chunk_size,
                    scheduled_at: due,
                })
                .await?;
            self.enqueue_batch(&txn, &run_id, &batch.id, due).await?;
            scheduled += 1;
        }

        self.stores
            .jobs
            .enqueue_in(
                &txn,
                CLEANUP_RUN,
                &run_id,
                json!({ "run_id": run_id }),
                cleanup_at,
            )
            .await?;

        txn.commit().await?;

        counter!("sync_batches_scheduled_total", "kind" => plan.kind.as_str())
            .increment(scheduled as u64);
        info!(
            run_id = %run_id,
            shop_id = %plan.shop_id,
            entity_type = %plan.entity_type,
            total_items = plan.entity_ids.len(),
            batches = scheduled,
            chunk_size,
            first_due_at = %base,
            "Sync run scheduled"
        );

        Ok(run_id)
    }

    async fn enqueue_batch<C>(
        &self,
        executor: &C,
        run_id: &str,
        batch_id: &str,
        due: DateTime<FixedOffset>,
    ) -> Result<(), SyncError>
    where
        C: ConnectionTrait,
    {
        self.stores
            .jobs
            .enqueue_in(
                executor,
                PROCESS_BATCH,
                run_id,
                json!({ "batch_id": batch_id }),
                due,
            )
            .await?;
        Ok(())
    }
}

/// Seconds until a retry: the vendor's `Retry-After` capped at `cap`, but
/// never sooner than the configured retry delay.
fn retry_delay_secs(retry_after_secs: Option<u64>, retry_delay: u64, cap: u64) -> u64 {
    retry_after_secs
        .unwrap_or(0)
        .min(cap)
        .max(retry_delay)
}

/// `from + secs`, or an error when that is not a representable time.
pub(crate) fn due_after(from: DateTime<Utc>, secs: u64) -> Result<DateTime<Utc>, SyncError> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|delay| from.checked_add_signed(delay))
        .ok_or_else(|| SyncError::invalid_input(format!("delay of {secs}s is out of range")))
}

/// Due time of the `index`th batch.
fn batch_due_at(base: DateTime<Utc>, stagger: Duration, index: usize) -> DateTime<FixedOffset> {
    (base + stagger * index as i32).fixed_offset()
}

/// Trimmed, non-blank ids in first-seen order.
fn unique_ids(entity_ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(entity_ids.len());
    entity_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_ids_keeps_first_occurrence_and_drops_blanks() {
        let ids: Vec<String> = ["a", " b ", "a", "", "c", "b"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(unique_ids(&ids), vec!["a", "b", "c"]);
    }

    #[test]
    fn retry_after_is_capped_and_never_undercuts_the_retry_delay() {
        assert_eq!(retry_delay_secs(None, 900, 86_400), 900);
        assert_eq!(retry_delay_secs(Some(30), 900, 86_400), 900);
        assert_eq!(retry_delay_secs(Some(1_800), 900, 86_400), 1_800);
        assert_eq!(retry_delay_secs(Some(u64::MAX), 900, 86_400), 86_400);
    }

    #[test]
    fn unrepresentable_delays_are_errors() {
        let now = Utc::now();
        assert!(due_after(now, u64::MAX).is_err());
        assert!(due_after(now, 10_000_000_000_000_000).is_err());
        assert_eq!(due_after(now, 60).unwrap(), now + Duration::minutes(1));
    }

    #[test]
    fn batches_are_staggered_from_the_base() {
        let base = Utc::now();
        let stagger = Duration::seconds(60);

        assert_eq!(batch_due_at(base, stagger, 0), base.fixed_offset());
        assert_eq!(
            batch_due_at(base, stagger, 2) - batch_due_at(base, stagger, 0),
            Duration::minutes(2)
        );
    }
}
