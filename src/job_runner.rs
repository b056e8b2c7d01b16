//! # Job Runner
//!
//! Polls `scheduled_jobs` for due rows, claims them and executes them with
//! bounded concurrency. Delivery is at-least-once:
//!
//! - a job failing with a retryable error is requeued with exponential
//!   backoff until `max_job_attempts` claims have been used
//! - a job left `running` past `job_lease_seconds` (its process died) is
//!   reclaimed on the next tick

use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::{counter, histogram};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use crate::config::{RunnerConfig, SyncConfig};
use crate::error::{ErrorClass, SyncError};
use crate::models::scheduled_job::{self, CLEANUP_RUN, PROCESS_BATCH};
use crate::repositories::{ScheduledJobRepository, SyncTrackingRepository};
use crate::telemetry::{TraceContext, with_trace_context};
use crate::worker::SyncWorker;

const MAX_JOB_BACKOFF_SECONDS: u64 = 3600;

#[derive(Clone)]
pub struct JobRunner {
    jobs: ScheduledJobRepository,
    tracking: SyncTrackingRepository,
    worker: Arc<SyncWorker>,
    runner: RunnerConfig,
    sync: SyncConfig,
}

impl JobRunner {
    pub fn new(
        jobs: ScheduledJobRepository,
        tracking: SyncTrackingRepository,
        worker: Arc<SyncWorker>,
        runner: RunnerConfig,
        sync: SyncConfig,
    ) -> Self {
        Self {
            jobs,
            tracking,
            worker,
            runner,
            sync,
        }
    }

    /// Runs the polling loop until `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            tick_ms = self.runner.tick_ms,
            concurrency = self.runner.concurrency,
            "Starting job runner"
        );
        let tick = TokioDuration::from_millis(self.runner.tick_ms);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Job runner shutdown requested");
                    break;
                }
                _ = sleep(tick) => {
                    let tick_started = Instant::now();
                    match self.run_due().await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "Executed scheduled jobs"),
                        Err(err) => error!(error = %err, "Job runner tick failed"),
                    }
                    histogram!("job_runner_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Job runner stopped");
    }

    /// Claims every job due now and waits for them to finish. Returns how
    /// many were executed.
    pub async fn run_due(&self) -> Result<usize, SyncError> {
        if let Some(cutoff) = Duration::try_seconds(self.runner.job_lease_seconds as i64)
            .and_then(|lease| Utc::now().checked_sub_signed(lease))
        {
            self.jobs
                .reclaim_expired(cutoff.fixed_offset(), self.runner.max_job_attempts)
                .await?;
        }

        let now = Utc::now().fixed_offset();
        let jobs = self.jobs.claim_due(now, self.runner.claim_batch).await?;
        if jobs.is_empty() {
            return Ok(0);
        }
        let count = jobs.len();

        let semaphore = Arc::new(Semaphore::new(self.runner.concurrency.max(1)));
        let mut handles = Vec::with_capacity(count);

        for job in jobs {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                warn!("Job semaphore closed, leaving remaining jobs running");
                break;
            };
            let runner = self.clone();
            let span = info_span!("job", job_id = %job.id, job_name = %job.job_name);

            handles.push(tokio::spawn(
                async move {
                    let _permit = permit;
                    runner.execute(job).await;
                }
                .instrument(span),
            ));
        }

        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "Job task panicked");
            }
        }

        Ok(count)
    }

    async fn execute(&self, job: scheduled_job::Model) {
        let context = TraceContext::generate();
        let result = with_trace_context(context, self.dispatch(&job)).await;

        let recorded = match &result {
            Ok(()) => {
                counter!("scheduled_jobs_total", "outcome" => "completed").increment(1);
                self.jobs.complete(job.id).await
            }
            Err(err)
                if err.class() != ErrorClass::Permanent
                    && job.attempts < self.runner.max_job_attempts =>
            {
                let delay = job_retry_delay(self.runner.job_retry_base_seconds, job.attempts);
                let run_at = (Utc::now() + delay).fixed_offset();
                counter!("scheduled_jobs_total", "outcome" => "requeued").increment(1);
                warn!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    run_at = %run_at,
                    error = %err,
                    "Scheduled job failed, requeued"
                );
                self.jobs.requeue(job.id, &err.to_string(), run_at).await
            }
            Err(err) => {
                counter!("scheduled_jobs_total", "outcome" => "failed").increment(1);
                warn!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    error = %err,
                    "Scheduled job failed"
                );
                self.jobs.fail(job.id, &err.to_string()).await
            }
        };

        if let Err(err) = recorded {
            error!(job_id = %job.id, error = %err, "Failed to record job result");
        }
    }

    async fn dispatch(&self, job: &scheduled_job::Model) -> Result<(), SyncError> {
        match job.job_name.as_str() {
            PROCESS_BATCH => {
                let batch_id = job
                    .payload_str("batch_id")
                    .ok_or_else(|| SyncError::invalid_input("job payload lacks batch_id"))?;
                self.worker.process_batch(batch_id).await?;
                Ok(())
            }
            CLEANUP_RUN => {
                let run_id = job
                    .payload_str("run_id")
                    .ok_or_else(|| SyncError::invalid_input("job payload lacks run_id"))?;
                self.cleanup_run(run_id).await
            }
            other => Err(SyncError::invalid_input(format!("unknown job '{other}'"))),
        }
    }

    /// Drops finished job rows of the run and tracking rows past retention.
    async fn cleanup_run(&self, run_id: &str) -> Result<(), SyncError> {
        let jobs_deleted = self.jobs.delete_finished_group(run_id).await?;
        let cutoff =
            (Utc::now() - Duration::days(self.sync.tracking_retention_days)).fixed_offset();
        let records_purged = self.tracking.purge_terminal_older_than(cutoff).await?;

        info!(
            run_id = %run_id,
            jobs_deleted,
            records_purged,
            "Run cleanup finished"
        );
        Ok(())
    }
}

/// Backoff before the next claim of a job that has been claimed `attempts`
/// times: `base * 2^(attempts - 1)` capped at an hour, plus up to 10% jitter.
fn job_retry_delay(base_seconds: u64, attempts: i32) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 20) as u32;
    let backoff = base_seconds
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(MAX_JOB_BACKOFF_SECONDS);
    let jitter_ms = if backoff > 0 {
        rand::thread_rng().gen_range(0..backoff * 100)
    } else {
        0
    };
    Duration::milliseconds((backoff * 1_000 + jitter_ms) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_backoff_doubles_per_attempt_with_bounded_jitter() {
        for (attempts, base) in [(1, 30), (2, 60), (3, 120)] {
            let delay = job_retry_delay(30, attempts).num_milliseconds();
            assert!(delay >= base * 1_000, "attempt {attempts}: {delay}");
            assert!(delay < base * 1_100, "attempt {attempts}: {delay}");
        }
    }

    #[test]
    fn job_backoff_is_capped() {
        let delay = job_retry_delay(30, 30).num_seconds();
        assert!((3_600..3_960).contains(&delay));
        assert_eq!(job_retry_delay(0, 2), Duration::zero());
    }
}
