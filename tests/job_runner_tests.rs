//! The scheduled-job runner draining due work.

mod test_utils;

use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, Utc};
use printsync::models::scheduled_job::{self, CLEANUP_RUN, PROCESS_BATCH};
use printsync::models::{EntityType, JobStatus, RunStatus, TrackingStatus};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use serde_json::json;
use test_utils::{Harness, SHOP, idle_load, product_ids, test_config};
use tokio_util::sync::CancellationToken;

async fn immediate_harness() -> Result<Harness> {
    let mut config = test_config();
    config.sync.stagger_interval_seconds = 0;
    config.runner.tick_ms = 20;
    Harness::with(config, idle_load()).await
}

#[tokio::test]
async fn due_batches_are_processed_and_the_run_completes() -> Result<()> {
    let h = immediate_harness().await?;
    let run_id = h
        .pipeline
        .scheduler
        .schedule_import(SHOP, EntityType::Product, &product_ids(15), "operator")
        .await?;

    let executed = h.pipeline.runner.run_due().await?;

    assert_eq!(executed, 2);
    assert_eq!(h.vendor.calls().len(), 15);

    let completed = h
        .pipeline
        .stores
        .tracking
        .count_for_run(&run_id, &[TrackingStatus::Completed])
        .await?;
    assert_eq!(completed, 15);

    let run = h.pipeline.stores.runs.find(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Completed.as_str());
    assert!(run.finished_at.is_some());

    let jobs = h.pipeline.stores.jobs.list_group(&run_id).await?;
    for job in &jobs {
        let expected = if job.job_name == PROCESS_BATCH {
            JobStatus::Completed
        } else {
            JobStatus::Queued
        };
        assert_eq!(job.status, expected.as_str(), "{}", job.job_name);
    }

    assert_eq!(h.pipeline.runner.run_due().await?, 0);

    Ok(())
}

#[tokio::test]
async fn future_jobs_are_left_alone() -> Result<()> {
    let h = Harness::new().await?;
    h.pipeline
        .scheduler
        .schedule_import(SHOP, EntityType::Product, &product_ids(25), "operator")
        .await?;

    // Only the first batch is due; the rest are staggered a minute apart.
    assert_eq!(h.pipeline.runner.run_due().await?, 1);
    assert_eq!(h.vendor.calls().len(), 10);

    Ok(())
}

#[tokio::test]
async fn cleanup_removes_finished_jobs_of_the_run() -> Result<()> {
    let h = immediate_harness().await?;
    let run_id = h
        .pipeline
        .scheduler
        .schedule_import(SHOP, EntityType::Product, &product_ids(3), "operator")
        .await?;
    h.pipeline.runner.run_due().await?;

    h.pipeline
        .stores
        .jobs
        .enqueue(
            CLEANUP_RUN,
            &run_id,
            json!({ "run_id": run_id }),
            Utc::now().fixed_offset(),
        )
        .await?;
    assert_eq!(h.pipeline.runner.run_due().await?, 1);

    let remaining = h.pipeline.stores.jobs.list_group(&run_id).await?;
    assert!(remaining.iter().all(|job| job.job_name == CLEANUP_RUN));
    assert_eq!(remaining.len(), 2);

    Ok(())
}

#[tokio::test]
async fn unknown_jobs_fail_without_stopping_the_runner() -> Result<()> {
    let h = immediate_harness().await?;
    let job = h
        .pipeline
        .stores
        .jobs
        .enqueue(
            "sync.mystery",
            "group-x",
            json!({}),
            Utc::now().fixed_offset(),
        )
        .await?;

    assert_eq!(h.pipeline.runner.run_due().await?, 1);

    let stored = h.pipeline.stores.jobs.list_group("group-x").await?;
    assert_eq!(stored[0].id, job.id);
    assert_eq!(stored[0].status, JobStatus::Failed.as_str());
    assert!(stored[0].error.as_deref().unwrap_or_default().contains("sync.mystery"));

    Ok(())
}

#[tokio::test]
async fn polling_loop_drains_work_until_shutdown() -> Result<()> {
    let h = immediate_harness().await?;
    let run_id = h
        .pipeline
        .scheduler
        .schedule_import(SHOP, EntityType::Product, &product_ids(4), "operator")
        .await?;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(h.pipeline.runner.clone().run(shutdown.clone()));

    let mut status = String::new();
    for _ in 0..100 {
        status = h.pipeline.stores.runs.find(&run_id).await?.unwrap().status;
        if status == RunStatus::Completed.as_str() {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
    assert_eq!(status, RunStatus::Completed.as_str());

    shutdown.cancel();
    tokio::time::timeout(StdDuration::from_secs(5), handle).await??;

    Ok(())
}

/// Enqueues a cleanup job that will fail on a storage error.
async fn failing_cleanup_job(h: &Harness) -> Result<uuid::Uuid> {
    let job = h
        .pipeline
        .stores
        .jobs
        .enqueue(
            CLEANUP_RUN,
            "run-broken",
            json!({ "run_id": "run-broken" }),
            Utc::now().fixed_offset(),
        )
        .await?;
    h.db.execute_unprepared("DROP TABLE sync_tracking").await?;
    Ok(job.id)
}

#[tokio::test]
async fn retryable_failures_are_requeued_with_backoff() -> Result<()> {
    let h = immediate_harness().await?;
    let job_id = failing_cleanup_job(&h).await?;

    let before = Utc::now();
    assert_eq!(h.pipeline.runner.run_due().await?, 1);

    let stored = h.pipeline.stores.jobs.list_group("run-broken").await?;
    assert_eq!(stored[0].id, job_id);
    assert_eq!(stored[0].status, JobStatus::Queued.as_str());
    assert_eq!(stored[0].attempts, 1);
    assert!(stored[0].started_at.is_none());
    assert!(stored[0].error.is_some());

    let delay = (stored[0].run_at.with_timezone(&Utc) - before).num_seconds();
    assert!((29..=34).contains(&delay), "requeued {delay}s out");

    // Not due yet.
    assert_eq!(h.pipeline.runner.run_due().await?, 0);

    Ok(())
}

#[tokio::test]
async fn jobs_fail_for_good_once_attempts_run_out() -> Result<()> {
    let mut config = test_utils::test_config();
    config.sync.stagger_interval_seconds = 0;
    config.runner.max_job_attempts = 1;
    let h = Harness::with(config, idle_load()).await?;
    failing_cleanup_job(&h).await?;

    assert_eq!(h.pipeline.runner.run_due().await?, 1);

    let stored = h.pipeline.stores.jobs.list_group("run-broken").await?;
    assert_eq!(stored[0].status, JobStatus::Failed.as_str());
    assert_eq!(stored[0].attempts, 1);

    Ok(())
}

#[tokio::test]
async fn orphaned_running_jobs_are_reclaimed_after_the_lease() -> Result<()> {
    let h = immediate_harness().await?;
    let run_id = h
        .pipeline
        .scheduler
        .schedule_import(SHOP, EntityType::Product, &product_ids(3), "operator")
        .await?;

    // A runner claims the batch job and dies before finishing it.
    let claimed = h
        .pipeline
        .stores
        .jobs
        .claim_due(Utc::now().fixed_offset(), 10)
        .await?;
    assert_eq!(claimed.len(), 1);
    assert_eq!(h.pipeline.runner.run_due().await?, 0);

    let long_ago = (Utc::now() - Duration::hours(2)).fixed_offset();
    scheduled_job::Entity::update_many()
        .col_expr(scheduled_job::Column::StartedAt, Expr::value(Some(long_ago)))
        .filter(scheduled_job::Column::Id.eq(claimed[0].id))
        .exec(&h.db)
        .await?;

    assert_eq!(h.pipeline.runner.run_due().await?, 1);

    let run = h.pipeline.stores.runs.find(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Completed.as_str());

    let job = h
        .pipeline
        .stores
        .jobs
        .list_group(&run_id)
        .await?
        .into_iter()
        .find(|job| job.id == claimed[0].id)
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed.as_str());
    assert_eq!(job.attempts, 2);

    Ok(())
}
