//! Batch scheduling, pause and resume against an in-memory database.

#[path = "test_utils/mod.rs"]
mod test_utils;

use std::collections::HashSet;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use printsync::error::{SyncError, SyncErrorKind};
use printsync::models::scheduled_job::{CLEANUP_RUN, PROCESS_BATCH};
use printsync::models::sync_batch::import_batch_id;
use printsync::models::{
    BatchKind, EntityType, JobStatus, RunStatus, TrackingStatus, sync_batch, sync_run,
    sync_tracking,
};
use printsync::repositories::EntityKey;
use printsync::trigger::PeriodicTrigger;
use sea_orm::{ConnectionTrait, EntityTrait, PaginatorTrait};
use test_utils::{Harness, SHOP, ids, overloaded, product_ids, test_config};

/// True when a stored timestamp is within a few seconds of `expected`.
fn within(actual: DateTime<FixedOffset>, expected: DateTime<Utc>) -> bool {
    (actual.with_timezone(&Utc) - expected).num_seconds().abs() <= 5
}

#[tokio::test]
async fn import_of_23_ids_yields_staggered_batches_of_10_10_3() -> Result<()> {
    let h = Harness::new().await?;
    let before = Utc::now();

    let run_id = h
        .pipeline
        .scheduler
        .schedule_import(SHOP, EntityType::Product, &product_ids(23), "operator")
        .await?;

    let batches = h.pipeline.stores.batches.list_for_run(&run_id).await?;
    let sizes: Vec<usize> = batches.iter().map(|b| b.entity_id_list().len()).collect();
    assert_eq!(sizes, vec![10, 10, 3]);

    assert!(within(batches[0].scheduled_at, before));
    assert!(within(batches[1].scheduled_at, before + Duration::minutes(1)));
    assert!(within(batches[2].scheduled_at, before + Duration::minutes(2)));
    assert_eq!(
        (batches[2].scheduled_at - batches[0].scheduled_at).num_seconds(),
        120
    );
    assert!(batches.iter().all(|b| b.kind == BatchKind::Import.as_str()));
    assert_eq!(batches[1].id, import_batch_id(&run_id, 1));

    let run = h.pipeline.stores.runs.find(&run_id).await?.unwrap();
    assert_eq!(run.total_items, 23);
    assert_eq!(run.status, RunStatus::Pending.as_str());
    assert_eq!(run.initiated_by, "operator");

    let jobs = h.pipeline.stores.jobs.list_group(&run_id).await?;
    let process_jobs = jobs.iter().filter(|j| j.job_name == PROCESS_BATCH).count();
    let cleanup: Vec<_> = jobs.iter().filter(|j| j.job_name == CLEANUP_RUN).collect();
    assert_eq!(process_jobs, 3);
    assert_eq!(cleanup.len(), 1);
    assert!(within(cleanup[0].run_at, before + Duration::hours(1)));
    assert_eq!(cleanup[0].payload_str("run_id"), Some(run_id.as_str()));

    Ok(())
}

#[tokio::test]
async fn every_unique_id_lands_in_exactly_one_batch() -> Result<()> {
    let h = Harness::new().await?;
    let mut requested = product_ids(37);
    requested.extend(ids(&["p3", "p3", " ", "p40"]));

    let run_id = h
        .pipeline
        .scheduler
        .schedule_import(SHOP, EntityType::Product, &requested, "operator")
        .await?;

    let batches = h.pipeline.stores.batches.list_for_run(&run_id).await?;
    let scheduled: Vec<String> = batches.iter().flat_map(|b| b.entity_id_list()).collect();
    let unique: HashSet<&String> = scheduled.iter().collect();

    assert_eq!(scheduled.len(), 38);
    assert_eq!(unique.len(), 38);
    assert!(unique.contains(&"p40".to_string()));

    let run = h.pipeline.stores.runs.find(&run_id).await?.unwrap();
    assert_eq!(run.total_items, 38);

    let pending = h
        .pipeline
        .stores
        .tracking
        .count_for_run(&run_id, &[TrackingStatus::Pending])
        .await?;
    assert_eq!(pending, 38);

    Ok(())
}

/// Checks that the run's batches partition `requested` into chunks of
/// `chunk` with only the last one shorter.
async fn assert_exact_cover(
    h: &Harness,
    run_id: &str,
    requested: &[String],
    chunk: usize,
) -> Result<()> {
    let batches = h.pipeline.stores.batches.list_for_run(run_id).await?;
    assert_eq!(batches.len(), requested.len().div_ceil(chunk), "chunk {chunk}");

    let mut seen = HashSet::new();
    for (index, batch) in batches.iter().enumerate() {
        let members = batch.entity_id_list();
        assert_eq!(batch.chunk_size as usize, chunk);
        if index + 1 < batches.len() {
            assert_eq!(members.len(), chunk, "batch {index}");
        } else {
            assert!((1..=chunk).contains(&members.len()), "last batch {index}");
        }
        for id in members {
            assert!(seen.insert(id.clone()), "{id} scheduled twice");
        }
    }

    let expected: HashSet<String> = requested.iter().cloned().collect();
    assert_eq!(seen, expected);
    Ok(())
}

#[tokio::test]
async fn coverage_holds_for_every_chunk_size() -> Result<()> {
    // (chunk, ids): bounds, an exact multiple and runs smaller than a chunk.
    for (chunk, count) in [(5, 23), (5, 5), (10, 40), (50, 120), (50, 7), (12, 37)] {
        let mut config = test_config();
        config.sync.default_chunk = chunk;
        let h = Harness::with(config, test_utils::idle_load()).await?;
        let requested = product_ids(count);

        let run_id = h
            .pipeline
            .scheduler
            .schedule_import(SHOP, EntityType::Product, &requested, "operator")
            .await?;

        assert_exact_cover(&h, &run_id, &requested, chunk).await?;
    }

    Ok(())
}

#[tokio::test]
async fn coverage_holds_after_the_optimizer_grows_the_chunk() -> Result<()> {
    let h = Harness::new().await?;

    let warmup = h
        .pipeline
        .scheduler
        .schedule_import(SHOP, EntityType::Product, &product_ids(10), "operator")
        .await?;
    let batch = import_batch_id(&warmup, 0);
    let report = h.pipeline.worker.process_batch(&batch).await?;
    assert_eq!(report.completed, 10);

    let requested: Vec<String> = (1..=37).map(|n| format!("q{n}")).collect();
    let run_id = h
        .pipeline
        .scheduler
        .schedule_import(SHOP, EntityType::Product, &requested, "operator")
        .await?;

    assert_exact_cover(&h, &run_id, &requested, 12).await?;

    Ok(())
}

#[tokio::test]
async fn failed_scheduling_leaves_no_partial_run() -> Result<()> {
    let h = Harness::new().await?;
    h.db
        .execute_unprepared("DROP TABLE scheduled_jobs")
        .await?;

    let err = h
        .pipeline
        .scheduler
        .schedule_import(SHOP, EntityType::Product, &product_ids(23), "operator")
        .await;
    assert!(err.is_err());

    assert_eq!(sync_run::Entity::find().count(&h.db).await?, 0);
    assert_eq!(sync_batch::Entity::find().count(&h.db).await?, 0);
    assert_eq!(sync_tracking::Entity::find().count(&h.db).await?, 0);

    Ok(())
}

#[tokio::test]
async fn invalid_requests_write_nothing() -> Result<()> {
    let h = Harness::new().await?;

    let err = h
        .pipeline
        .scheduler
        .schedule_import(SHOP, EntityType::Product, &ids(&["", "  "]), "operator")
        .await
        .unwrap_err();
    assert!(matches!(err.kind, SyncErrorKind::InvalidInput));

    let err = h
        .pipeline
        .scheduler
        .schedule_import(" ", EntityType::Product, &ids(&["p1"]), "operator")
        .await
        .unwrap_err();
    assert!(matches!(err.kind, SyncErrorKind::InvalidInput));

    let active = h
        .pipeline
        .stores
        .runs
        .find_active(SHOP, EntityType::Product, "operator")
        .await?;
    assert!(active.is_none());

    Ok(())
}

#[tokio::test]
async fn throttled_host_pushes_the_whole_run_back() -> Result<()> {
    let h = Harness::with(test_config(), overloaded()).await?;
    let before = Utc::now();

    let run_id = h
        .pipeline
        .scheduler
        .schedule_import(SHOP, EntityType::Product, &product_ids(12), "operator")
        .await?;

    let batches = h.pipeline.stores.batches.list_for_run(&run_id).await?;
    assert!(within(batches[0].scheduled_at, before + Duration::seconds(300)));
    assert!(within(batches[1].scheduled_at, before + Duration::seconds(360)));

    Ok(())
}

#[tokio::test]
async fn webhook_update_is_a_single_settled_batch() -> Result<()> {
    let h = Harness::new().await?;
    let before = Utc::now();

    let run_id = h
        .pipeline
        .scheduler
        .schedule_webhook_update("o-77", SHOP, EntityType::Order, "order.updated")
        .await?;

    let batches = h.pipeline.stores.batches.list_for_run(&run_id).await?;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].kind, BatchKind::Webhook.as_str());
    assert_eq!(batches[0].entity_id_list(), vec!["o-77"]);
    assert!(within(batches[0].scheduled_at, before + Duration::seconds(10)));

    let run = h.pipeline.stores.runs.find(&run_id).await?.unwrap();
    assert_eq!(run.initiated_by, "webhook");
    assert_eq!(run.total_items, 1);

    assert_eq!(
        h.pipeline.scheduler.settle_delay("product.updated"),
        Duration::seconds(30)
    );
    assert_eq!(
        h.pipeline.scheduler.settle_delay("shop.disconnected"),
        Duration::zero()
    );

    Ok(())
}

#[tokio::test]
async fn pause_unschedules_queued_work_and_notifies() -> Result<()> {
    let h = Harness::new().await?;
    let run_id = h
        .pipeline
        .scheduler
        .schedule_import(SHOP, EntityType::Product, &product_ids(25), "operator")
        .await?;

    let report = h
        .pipeline
        .scheduler
        .pause_run(&run_id, "vendor credentials rejected")
        .await?;

    assert_eq!(report.cancelled_batches, 3);
    assert_eq!(report.unscheduled_jobs, 3);
    assert_eq!(report.affected, 25);

    let run = h.pipeline.stores.runs.find(&run_id).await?.unwrap();
    assert_eq!(run.status, RunStatus::Paused.as_str());
    assert_eq!(run.last_error.as_deref(), Some("vendor credentials rejected"));

    let jobs = h.pipeline.stores.jobs.list_group(&run_id).await?;
    for job in &jobs {
        let expected = if job.job_name == CLEANUP_RUN {
            JobStatus::Queued
        } else {
            JobStatus::Cancelled
        };
        assert_eq!(job.status, expected.as_str(), "{}", job.job_name);
    }
    assert_eq!(jobs.iter().filter(|j| j.job_name == CLEANUP_RUN).count(), 1);

    let alerts = h.notifier.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].run_id, run_id);
    assert_eq!(alerts[0].affected, 25);
    assert!(alerts[0].subject.contains(&run_id));

    Ok(())
}

#[tokio::test]
async fn resume_creates_a_child_run_for_unfinished_entities() -> Result<()> {
    let h = Harness::new().await?;
    let run_id = h
        .pipeline
        .scheduler
        .schedule_import(SHOP, EntityType::Product, &product_ids(6), "operator")
        .await?;

    let tracking = &h.pipeline.stores.tracking;
    tracking
        .mark_completed(&EntityKey::new(EntityType::Product, SHOP, "p1"), &run_id, "local-1")
        .await?;
    tracking
        .mark_failed(&EntityKey::new(EntityType::Product, SHOP, "p2"), &run_id, "not found")
        .await?;

    let err = h
        .pipeline
        .scheduler
        .resume_import(&run_id)
        .await
        .unwrap_err();
    assert!(matches!(err.kind, SyncErrorKind::InvalidTransition { .. }));

    h.pipeline.scheduler.pause_run(&run_id, "db down").await?;
    let child_id = h.pipeline.scheduler.resume_import(&run_id).await?;
    assert_ne!(child_id, run_id);

    let child = h.pipeline.stores.runs.find(&child_id).await?.unwrap();
    assert_eq!(child.parent_run_id.as_deref(), Some(run_id.as_str()));
    assert_eq!(child.initiated_by, "resume");
    assert_eq!(child.total_items, 5);

    let rescheduled: HashSet<String> = h
        .pipeline
        .stores
        .batches
        .list_for_run(&child_id)
        .await?
        .iter()
        .flat_map(|b| b.entity_id_list())
        .collect();
    assert!(!rescheduled.contains("p1"));
    assert!(rescheduled.contains("p2"));
    assert_eq!(rescheduled.len(), 5);

    let p2 = tracking
        .find(&EntityKey::new(EntityType::Product, SHOP, "p2"))
        .await?
        .unwrap();
    assert_eq!(p2.attempts, 0);
    assert_eq!(p2.run_id.as_deref(), Some(child_id.as_str()));

    let parent = h.pipeline.stores.runs.find(&run_id).await?.unwrap();
    assert_eq!(parent.status, RunStatus::Paused.as_str());
    assert_eq!(
        h.pipeline.stores.runs.list_children(&run_id).await?.len(),
        1
    );

    Ok(())
}

#[tokio::test]
async fn resume_with_nothing_left_is_rejected() -> Result<()> {
    let h = Harness::new().await?;
    let run_id = h
        .pipeline
        .scheduler
        .schedule_import(SHOP, EntityType::Product, &ids(&["p1"]), "operator")
        .await?;
    h.pipeline
        .stores
        .tracking
        .mark_completed(&EntityKey::new(EntityType::Product, SHOP, "p1"), &run_id, "l1")
        .await?;
    h.pipeline.scheduler.pause_run(&run_id, "auth").await?;

    let err: SyncError = h
        .pipeline
        .scheduler
        .resume_import(&run_id)
        .await
        .unwrap_err();
    assert!(matches!(err.kind, SyncErrorKind::InvalidInput));

    Ok(())
}

#[tokio::test]
async fn periodic_trigger_imports_listing_once_at_a_time() -> Result<()> {
    let h = Harness::new().await?;
    h.vendor.set_listing(product_ids(4));

    let trigger = PeriodicTrigger::new(
        h.pipeline.scheduler.clone(),
        h.vendor.clone(),
        h.pipeline.stores.runs.clone(),
        SHOP.to_string(),
        StdDuration::from_secs(3600),
    );

    let run_id = trigger.tick().await?.expect("first tick schedules a run");
    let run = h.pipeline.stores.runs.find(&run_id).await?.unwrap();
    assert_eq!(run.initiated_by, "periodic");
    assert_eq!(run.total_items, 4);

    assert_eq!(trigger.tick().await?, None);

    Ok(())
}
