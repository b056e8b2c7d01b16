//! # SyncTracking Repository
//!
//! Per-entity sync state. The attempt counter is only ever changed by
//! [`SyncTrackingRepository::record_failure`], in the same UPDATE that
//! stores the error.

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::sync_tracking::{ActiveModel, Column, Entity, Model};
use crate::models::{EntityType, TrackingStatus};

/// Rows per multi-row INSERT; keeps SQLite under its bind parameter limit.
const UPSERT_CHUNK: usize = 50;

/// Identity of a tracked entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub shop_id: String,
    pub remote_id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, shop_id: &str, remote_id: &str) -> Self {
        Self {
            entity_type,
            shop_id: shop_id.to_string(),
            remote_id: remote_id.to_string(),
        }
    }

    fn condition(&self) -> Condition {
        Condition::all()
            .add(Column::EntityType.eq(self.entity_type.as_str()))
            .add(Column::ShopId.eq(self.shop_id.as_str()))
            .add(Column::RemoteId.eq(self.remote_id.as_str()))
    }
}

/// Result of recording a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Attempt count after the increment
    pub attempts: i32,
    /// True when the entity was put back to `pending` for another try
    pub will_retry: bool,
}

/// Completed vs failed entity counts over a window, for batch sizing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub completed: u64,
    pub errored: u64,
}

impl OutcomeCounts {
    pub fn total(&self) -> u64 {
        self.completed + self.errored
    }
}

/// Repository for sync tracking database operations
#[derive(Clone)]
pub struct SyncTrackingRepository {
    db: DatabaseConnection,
}

impl SyncTrackingRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Hands the entities to `run_id` as `pending` with a zeroed attempt count.
    ///
    /// Existing records (including completed ones) are taken over by the new
    /// run: a new run is an explicit request to re-sync.
    pub async fn assign_to_run(
        &self,
        entity_type: EntityType,
        shop_id: &str,
        remote_ids: &[String],
        run_id: &str,
    ) -> Result<(), SyncError> {
        self.assign_to_run_in(&self.db, entity_type, shop_id, remote_ids, run_id)
            .await
    }

    pub async fn assign_to_run_in<C>(
        &self,
        executor: &C,
        entity_type: EntityType,
        shop_id: &str,
        remote_ids: &[String],
        run_id: &str,
    ) -> Result<(), SyncError>
    where
        C: ConnectionTrait,
    {
        let now = Utc::now().fixed_offset();

        for chunk in remote_ids.chunks(UPSERT_CHUNK) {
            let rows = chunk.iter().map(|remote_id| ActiveModel {
                id: Set(Uuid::new_v4()),
                entity_type: Set(entity_type.as_str().to_string()),
                shop_id: Set(shop_id.to_string()),
                remote_id: Set(remote_id.clone()),
                local_id: Set(None),
                run_id: Set(Some(run_id.to_string())),
                status: Set(TrackingStatus::Pending.as_str().to_string()),
                last_error: Set(None),
                last_attempt_at: Set(None),
                attempts: Set(0),
                created_at: Set(now),
                updated_at: Set(now),
            });

            Entity::insert_many(rows)
                .on_conflict(
                    OnConflict::columns([Column::EntityType, Column::ShopId, Column::RemoteId])
                        .update_columns([
                            Column::RunId,
                            Column::Status,
                            Column::LastError,
                            Column::Attempts,
                            Column::UpdatedAt,
                        ])
                        .to_owned(),
                )
                .exec(executor)
                .await?;
        }

        tracing::debug!(
            run_id = %run_id,
            shop_id = %shop_id,
            count = remote_ids.len(),
            "Tracking records assigned to run"
        );

        Ok(())
    }

    pub async fn find(&self, key: &EntityKey) -> Result<Option<Model>, SyncError> {
        Ok(Entity::find()
            .filter(key.condition())
            .one(&self.db)
            .await?)
    }

    /// Claims the entity for processing on behalf of `run_id`.
    ///
    /// Returns false when the record is already completed or owned by
    /// another run.
    pub async fn claim_processing(&self, key: &EntityKey, run_id: &str) -> Result<bool, SyncError> {
        let now = Utc::now().fixed_offset();

        let result = Entity::update_many()
            .col_expr(
                Column::Status,
                Expr::value(TrackingStatus::Processing.as_str()),
            )
            .col_expr(Column::LastAttemptAt, Expr::value(Some(now)))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(key.condition())
            .filter(Column::RunId.eq(run_id))
            .filter(Column::Status.ne(TrackingStatus::Completed.as_str()))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Marks the entity applied for `run_id`. Repeating the call is harmless;
    /// a record taken over by another run is left alone.
    pub async fn mark_completed(
        &self,
        key: &EntityKey,
        run_id: &str,
        local_id: &str,
    ) -> Result<(), SyncError> {
        let now = Utc::now().fixed_offset();

        Entity::update_many()
            .col_expr(
                Column::Status,
                Expr::value(TrackingStatus::Completed.as_str()),
            )
            .col_expr(Column::LocalId, Expr::value(Some(local_id.to_string())))
            .col_expr(Column::LastError, Expr::value(Option::<String>::None))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(key.condition())
            .filter(Column::RunId.eq(run_id))
            .exec(&self.db)
            .await?;

        Ok(())
    }

    /// Counts a transient failure against the entity.
    ///
    /// The increment, the error and the `pending`/`failed` decision are one
    /// statement, so the counter can never pass `max_retries`. Returns `None`
    /// if the record is no longer owned by `run_id` or already completed.
    pub async fn record_failure(
        &self,
        key: &EntityKey,
        run_id: &str,
        error: &str,
        max_retries: i32,
    ) -> Result<Option<FailureOutcome>, SyncError> {
        let now = Utc::now().fixed_offset();

        let result = Entity::update_many()
            .col_expr(
                Column::Status,
                Expr::case(
                    Expr::col(Column::Attempts).lt(max_retries - 1),
                    TrackingStatus::Pending.as_str(),
                )
                .finally(TrackingStatus::Failed.as_str())
                .into(),
            )
            .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
            .col_expr(Column::LastError, Expr::value(Some(error.to_string())))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(key.condition())
            .filter(Column::RunId.eq(run_id))
            .filter(Column::Status.ne(TrackingStatus::Completed.as_str()))
            .filter(Column::Attempts.lt(max_retries))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }

        let record = self
            .find(key)
            .await?
            .ok_or_else(|| SyncError::critical("tracking record vanished during update"))?;

        Ok(Some(FailureOutcome {
            attempts: record.attempts,
            will_retry: record.status == TrackingStatus::Pending.as_str(),
        }))
    }

    /// Leaves the entity `pending` with the error, without touching attempts.
    pub async fn mark_pending_with_error(
        &self,
        key: &EntityKey,
        run_id: &str,
        error: &str,
    ) -> Result<(), SyncError> {
        self.set_status_with_error(key, run_id, TrackingStatus::Pending, error)
            .await
    }

    /// Gives up on the entity.
    pub async fn mark_failed(
        &self,
        key: &EntityKey,
        run_id: &str,
        error: &str,
    ) -> Result<(), SyncError> {
        self.set_status_with_error(key, run_id, TrackingStatus::Failed, error)
            .await
    }

    async fn set_status_with_error(
        &self,
        key: &EntityKey,
        run_id: &str,
        status: TrackingStatus,
        error: &str,
    ) -> Result<(), SyncError> {
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .col_expr(Column::LastError, Expr::value(Some(error.to_string())))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(key.condition())
            .filter(Column::RunId.eq(run_id))
            .filter(Column::Status.ne(TrackingStatus::Completed.as_str()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Records owned by the run, optionally restricted to some statuses.
    pub async fn list_for_run(
        &self,
        run_id: &str,
        statuses: &[TrackingStatus],
    ) -> Result<Vec<Model>, SyncError> {
        let mut query = Entity::find().filter(Column::RunId.eq(run_id));
        if !statuses.is_empty() {
            query = query.filter(Column::Status.is_in(statuses.iter().map(|s| s.as_str())));
        }
        Ok(query
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::RemoteId)
            .all(&self.db)
            .await?)
    }

    pub async fn count_for_run(
        &self,
        run_id: &str,
        statuses: &[TrackingStatus],
    ) -> Result<u64, SyncError> {
        Ok(Entity::find()
            .filter(Column::RunId.eq(run_id))
            .filter(Column::Status.is_in(statuses.iter().map(|s| s.as_str())))
            .count(&self.db)
            .await?)
    }

    /// Outcomes recorded since `since`, for one run or across all runs.
    ///
    /// Errors are failed records plus pending ones carrying an error, i.e.
    /// entities waiting on a retry.
    pub async fn outcome_counts(
        &self,
        run_id: Option<&str>,
        since: DateTimeWithTimeZone,
    ) -> Result<OutcomeCounts, SyncError> {
        let scoped = |query: sea_orm::Select<Entity>| match run_id {
            Some(run_id) => query.filter(Column::RunId.eq(run_id)),
            None => query,
        };

        let completed = scoped(Entity::find())
            .filter(Column::UpdatedAt.gte(since))
            .filter(Column::Status.eq(TrackingStatus::Completed.as_str()))
            .count(&self.db)
            .await?;

        let errored = scoped(Entity::find())
            .filter(Column::UpdatedAt.gte(since))
            .filter(
                Condition::any()
                    .add(Column::Status.eq(TrackingStatus::Failed.as_str()))
                    .add(
                        Condition::all()
                            .add(Column::Status.eq(TrackingStatus::Pending.as_str()))
                            .add(Column::LastError.is_not_null()),
                    ),
            )
            .count(&self.db)
            .await?;

        Ok(OutcomeCounts { completed, errored })
    }

    /// Deletes completed and failed records untouched since `cutoff`.
    pub async fn purge_terminal_older_than(
        &self,
        cutoff: DateTimeWithTimeZone,
    ) -> Result<u64, SyncError> {
        let result = Entity::delete_many()
            .filter(Column::Status.is_in([
                TrackingStatus::Completed.as_str(),
                TrackingStatus::Failed.as_str(),
            ]))
            .filter(Column::UpdatedAt.lt(cutoff))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}
