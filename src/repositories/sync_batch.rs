//! # SyncBatch Repository
//!
//! Queue-side tracking: which chunk of which run is scheduled when, and
//! where it stands.

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set,
};

use crate::error::SyncError;
use crate::models::sync_batch::{ActiveModel, Column, Entity, Model};
use crate::models::{BatchKind, BatchStatus};

/// Fields needed to record a batch.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub id: String,
    pub run_id: String,
    pub seq: usize,
    pub kind: BatchKind,
    pub entity_ids: Vec<String>,
    pub chunk_size: usize,
    pub scheduled_at: DateTimeWithTimeZone,
}

/// Repository for sync batch database operations
#[derive(Clone)]
pub struct SyncBatchRepository {
    db: DatabaseConnection,
}

impl SyncBatchRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn create(&self, new_batch: NewBatch) -> Result<Model, SyncError> {
        self.create_in(&self.db, new_batch).await
    }

    pub async fn create_in<C>(&self, executor: &C, new_batch: NewBatch) -> Result<Model, SyncError>
    where
        C: ConnectionTrait,
    {
        let now = Utc::now().fixed_offset();

        let batch = ActiveModel {
            id: Set(new_batch.id),
            run_id: Set(new_batch.run_id),
            seq: Set(new_batch.seq as i32),
            kind: Set(new_batch.kind.as_str().to_string()),
            entity_ids: Set(serde_json::Value::from(new_batch.entity_ids)),
            chunk_size: Set(new_batch.chunk_size as i32),
            scheduled_at: Set(new_batch.scheduled_at),
            status: Set(BatchStatus::Scheduled.as_str().to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let result = batch.insert(executor).await?;

        tracing::debug!(
            batch_id = %result.id,
            run_id = %result.run_id,
            kind = %result.kind,
            scheduled_at = %result.scheduled_at,
            "Sync batch recorded"
        );

        Ok(result)
    }

    pub async fn find(&self, batch_id: &str) -> Result<Option<Model>, SyncError> {
        Ok(Entity::find_by_id(batch_id.to_string())
            .one(&self.db)
            .await?)
    }

    /// Batches of a run in sequence order.
    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<Model>, SyncError> {
        Ok(Entity::find()
            .filter(Column::RunId.eq(run_id))
            .order_by_asc(Column::Seq)
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    pub async fn set_status(&self, batch_id: &str, status: BatchStatus) -> Result<(), SyncError> {
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(batch_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Pushes a batch back to `until` while the host is overloaded.
    pub async fn defer(
        &self,
        batch_id: &str,
        until: DateTimeWithTimeZone,
    ) -> Result<(), SyncError> {
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(BatchStatus::Deferred.as_str()))
            .col_expr(Column::ScheduledAt, Expr::value(until))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(batch_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Cancels every batch of the run that has not finished. Returns how many changed.
    pub async fn cancel_open_for_run(&self, run_id: &str) -> Result<u64, SyncError> {
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(BatchStatus::Cancelled.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::RunId.eq(run_id))
            .filter(Column::Status.is_in(BatchStatus::OPEN.map(|s| s.as_str())))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Unfinished batches of the run other than `excluding`.
    pub async fn count_open_for_run(
        &self,
        run_id: &str,
        excluding: Option<&str>,
    ) -> Result<u64, SyncError> {
        let mut query = Entity::find()
            .filter(Column::RunId.eq(run_id))
            .filter(Column::Status.is_in(BatchStatus::OPEN.map(|s| s.as_str())));
        if let Some(batch_id) = excluding {
            query = query.filter(Column::Id.ne(batch_id));
        }
        Ok(query.count(&self.db).await?)
    }

    /// Chunk size of the most recent import batch, scoped to a run when given.
    pub async fn latest_import_chunk_size(
        &self,
        run_id: Option<&str>,
    ) -> Result<Option<usize>, SyncError> {
        let mut query = Entity::find().filter(Column::Kind.eq(BatchKind::Import.as_str()));
        if let Some(run_id) = run_id {
            query = query.filter(Column::RunId.eq(run_id));
        }

        let latest = query
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Seq)
            .one(&self.db)
            .await?;

        Ok(latest.map(|batch| batch.chunk_size.max(0) as usize))
    }
}
