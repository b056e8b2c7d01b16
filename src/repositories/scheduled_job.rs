//! # ScheduledJob Repository
//!
//! The deferred job queue: enqueue, claim when due, record the outcome,
//! requeue failures, reclaim orphaned claims, unschedule by group.

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::JobStatus;
use crate::models::scheduled_job::{ActiveModel, Column, Entity, Model};

/// Repository for scheduled job database operations
#[derive(Clone)]
pub struct ScheduledJobRepository {
    db: DatabaseConnection,
}

impl ScheduledJobRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Queue `job_name` to run at `run_at`.
    pub async fn enqueue(
        &self,
        job_name: &str,
        group_key: &str,
        payload: JsonValue,
        run_at: DateTimeWithTimeZone,
    ) -> Result<Model, SyncError> {
        self.enqueue_in(&self.db, job_name, group_key, payload, run_at)
            .await
    }

    /// [`Self::enqueue`] on a caller-provided connection or transaction.
    pub async fn enqueue_in<C>(
        &self,
        executor: &C,
        job_name: &str,
        group_key: &str,
        payload: JsonValue,
        run_at: DateTimeWithTimeZone,
    ) -> Result<Model, SyncError>
    where
        C: ConnectionTrait,
    {
        let now = Utc::now().fixed_offset();

        let job = ActiveModel {
            id: Set(Uuid::new_v4()),
            job_name: Set(job_name.to_string()),
            group_key: Set(group_key.to_string()),
            payload: Set(payload),
            run_at: Set(run_at),
            status: Set(JobStatus::Queued.as_str().to_string()),
            attempts: Set(0),
            started_at: Set(None),
            finished_at: Set(None),
            error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let result = job.insert(executor).await?;

        tracing::debug!(
            job_id = %result.id,
            job_name = %result.job_name,
            group_key = %result.group_key,
            run_at = %result.run_at,
            "Job scheduled"
        );

        Ok(result)
    }

    /// Atomically moves up to `limit` due jobs from `queued` to `running`.
    pub async fn claim_due(
        &self,
        now: DateTimeWithTimeZone,
        limit: u64,
    ) -> Result<Vec<Model>, SyncError> {
        let txn = self.db.begin().await?;

        let eligible: Vec<Uuid> = Entity::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::Status.eq(JobStatus::Queued.as_str()))
            .filter(Column::RunAt.lte(now))
            .order_by_asc(Column::RunAt)
            .limit(limit)
            .into_tuple()
            .all(&txn)
            .await?;

        if eligible.is_empty() {
            txn.commit().await?;
            return Ok(Vec::new());
        }

        // Status guard keeps a concurrent claimer from taking the same rows.
        let update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Running.as_str()))
            .col_expr(Column::StartedAt, Expr::value(Some(now)))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
            .filter(Column::Id.is_in(eligible.clone()))
            .filter(Column::Status.eq(JobStatus::Queued.as_str()))
            .exec(&txn)
            .await?;

        let claimed = if update.rows_affected > 0 {
            Entity::find()
                .filter(Column::Id.is_in(eligible))
                .filter(Column::Status.eq(JobStatus::Running.as_str()))
                .filter(Column::StartedAt.eq(now))
                .order_by_asc(Column::RunAt)
                .all(&txn)
                .await?
        } else {
            Vec::new()
        };

        txn.commit().await?;
        Ok(claimed)
    }

    pub async fn complete(&self, job_id: Uuid) -> Result<(), SyncError> {
        self.finish(job_id, JobStatus::Completed, None).await
    }

    pub async fn fail(&self, job_id: Uuid, error: &str) -> Result<(), SyncError> {
        self.finish(job_id, JobStatus::Failed, Some(error)).await
    }

    /// Puts a failed running job back in the queue, due at `run_at`.
    pub async fn requeue(
        &self,
        job_id: Uuid,
        error: &str,
        run_at: DateTimeWithTimeZone,
    ) -> Result<(), SyncError> {
        let now = Utc::now().fixed_offset();

        Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Queued.as_str()))
            .col_expr(Column::RunAt, Expr::value(run_at))
            .col_expr(Column::StartedAt, Expr::value(Option::<DateTimeWithTimeZone>::None))
            .col_expr(Column::Error, Expr::value(Some(error.to_string())))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .exec(&self.db)
            .await?;

        Ok(())
    }

    /// Releases jobs stuck in `running` since before `started_before`.
    ///
    /// Jobs with attempts left go back to `queued` and become due at once;
    /// the rest are marked `failed`. Returns `(requeued, failed)`.
    pub async fn reclaim_expired(
        &self,
        started_before: DateTimeWithTimeZone,
        max_attempts: i32,
    ) -> Result<(u64, u64), SyncError> {
        let now = Utc::now().fixed_offset();
        let txn = self.db.begin().await?;

        let requeued = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Queued.as_str()))
            .col_expr(Column::RunAt, Expr::value(now))
            .col_expr(Column::StartedAt, Expr::value(Option::<DateTimeWithTimeZone>::None))
            .col_expr(Column::Error, Expr::value(Some("job lease expired".to_string())))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .filter(Column::StartedAt.lt(started_before))
            .filter(Column::Attempts.lt(max_attempts))
            .exec(&txn)
            .await?;

        let failed = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Failed.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(Some(now)))
            .col_expr(
                Column::Error,
                Expr::value(Some("job lease expired, attempts exhausted".to_string())),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .filter(Column::StartedAt.lt(started_before))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        if requeued.rows_affected > 0 || failed.rows_affected > 0 {
            tracing::warn!(
                requeued = requeued.rows_affected,
                failed = failed.rows_affected,
                "Reclaimed jobs with expired leases"
            );
        }

        Ok((requeued.rows_affected, failed.rows_affected))
    }

    async fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), SyncError> {
        let now = Utc::now().fixed_offset();

        Entity::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(Some(now)))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .col_expr(Column::Error, Expr::value(error.map(str::to_string)))
            .filter(Column::Id.eq(job_id))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .exec(&self.db)
            .await?;

        Ok(())
    }

    /// Cancels the queued `job_name` jobs of the group. Running jobs and
    /// other job kinds are left alone.
    pub async fn unschedule_group(
        &self,
        group_key: &str,
        job_name: &str,
    ) -> Result<u64, SyncError> {
        let now = Utc::now().fixed_offset();

        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Cancelled.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(Some(now)))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::GroupKey.eq(group_key))
            .filter(Column::JobName.eq(job_name))
            .filter(Column::Status.eq(JobStatus::Queued.as_str()))
            .exec(&self.db)
            .await?;

        tracing::info!(
            group_key = %group_key,
            job_name = %job_name,
            unscheduled = result.rows_affected,
            "Unscheduled queued jobs"
        );

        Ok(result.rows_affected)
    }

    /// Deletes finished rows of the group. Returns the number deleted.
    pub async fn delete_finished_group(&self, group_key: &str) -> Result<u64, SyncError> {
        let result = Entity::delete_many()
            .filter(Column::GroupKey.eq(group_key))
            .filter(Column::Status.is_in(JobStatus::FINISHED.map(|s| s.as_str())))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Jobs of a group ordered by due time.
    pub async fn list_group(&self, group_key: &str) -> Result<Vec<Model>, SyncError> {
        Ok(Entity::find()
            .filter(Column::GroupKey.eq(group_key))
            .order_by_asc(Column::RunAt)
            .all(&self.db)
            .await?)
    }
}
