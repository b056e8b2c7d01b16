//! # SyncRun Repository
//!
//! Run records and their forward-only status machine.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::SyncError;
use crate::models::sync_run::{ActiveModel, Column, Entity, Model};
use crate::models::{EntityType, RunStatus, TrackingStatus, sync_tracking};

/// Fields needed to open a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: String,
    pub shop_id: String,
    pub entity_type: EntityType,
    pub total_items: usize,
    pub initiated_by: String,
    pub parent_run_id: Option<String>,
}

/// Per-status entity counts for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct RunSummary {
    pub run_id: String,
    pub status: String,
    pub total_items: i32,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Repository for sync run database operations
#[derive(Clone)]
pub struct SyncRunRepository {
    db: DatabaseConnection,
}

impl SyncRunRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Generates a fresh opaque run id.
    pub fn next_run_id() -> String {
        format!("run_{}", uuid::Uuid::new_v4().simple())
    }

    /// Persist a new run in `pending`.
    pub async fn create(&self, new_run: NewRun) -> Result<Model, SyncError> {
        self.create_in(&self.db, new_run).await
    }

    pub async fn create_in<C>(&self, executor: &C, new_run: NewRun) -> Result<Model, SyncError>
    where
        C: ConnectionTrait,
    {
        let now = Utc::now().fixed_offset();

        let run = ActiveModel {
            id: Set(new_run.id),
            shop_id: Set(new_run.shop_id),
            entity_type: Set(new_run.entity_type.as_str().to_string()),
            total_items: Set(new_run.total_items as i32),
            status: Set(RunStatus::Pending.as_str().to_string()),
            initiated_by: Set(new_run.initiated_by),
            parent_run_id: Set(new_run.parent_run_id),
            last_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            finished_at: Set(None),
        };

        let result = run.insert(executor).await?;

        tracing::info!(
            run_id = %result.id,
            shop_id = %result.shop_id,
            entity_type = %result.entity_type,
            total_items = result.total_items,
            initiated_by = %result.initiated_by,
            "Sync run created"
        );

        Ok(result)
    }

    pub async fn find(&self, run_id: &str) -> Result<Option<Model>, SyncError> {
        Ok(Entity::find_by_id(run_id.to_string()).one(&self.db).await?)
    }

    /// Moves a run to `to` if its current status allows it.
    ///
    /// Transitioning to the status the run already has is a no-op. Anything
    /// else that is not a forward move yields `InvalidTransition` and writes
    /// nothing.
    pub async fn transition(
        &self,
        run_id: &str,
        to: RunStatus,
        last_error: Option<&str>,
    ) -> Result<Model, SyncError> {
        let now = Utc::now().fixed_offset();
        let predecessors: Vec<&'static str> = to
            .allowed_predecessors()
            .iter()
            .map(|status| status.as_str())
            .collect();

        let mut update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(to.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(now));
        if to.is_terminal() {
            update = update.col_expr(Column::FinishedAt, Expr::value(Some(now)));
        }
        if let Some(message) = last_error {
            update = update.col_expr(Column::LastError, Expr::value(message));
        }

        let result = update
            .filter(Column::Id.eq(run_id))
            .filter(Column::Status.is_in(predecessors))
            .exec(&self.db)
            .await?;

        let run = self
            .find(run_id)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("sync run {run_id}")))?;

        if result.rows_affected == 0 && run.status != to.as_str() {
            tracing::warn!(
                run_id = %run_id,
                from = %run.status,
                to = %to,
                "Rejected backward run transition"
            );
            return Err(SyncError::invalid_transition(&run.status, to.as_str()));
        }

        if result.rows_affected > 0 {
            tracing::info!(run_id = %run_id, status = %to, "Sync run transitioned");
        }

        Ok(run)
    }

    /// Most recent pending or running run for a shop started by `initiated_by`.
    pub async fn find_active(
        &self,
        shop_id: &str,
        entity_type: EntityType,
        initiated_by: &str,
    ) -> Result<Option<Model>, SyncError> {
        Ok(Entity::find()
            .filter(Column::ShopId.eq(shop_id))
            .filter(Column::EntityType.eq(entity_type.as_str()))
            .filter(Column::InitiatedBy.eq(initiated_by))
            .filter(
                Column::Status.is_in([RunStatus::Pending.as_str(), RunStatus::Running.as_str()]),
            )
            .order_by_desc(Column::CreatedAt)
            .one(&self.db)
            .await?)
    }

    /// Child runs created by resuming `parent_run_id`.
    pub async fn list_children(&self, parent_run_id: &str) -> Result<Vec<Model>, SyncError> {
        Ok(Entity::find()
            .filter(Column::ParentRunId.eq(parent_run_id))
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    /// Entity counts per tracking status for monitoring.
    pub async fn summary(&self, run_id: &str) -> Result<RunSummary, SyncError> {
        let run = self
            .find(run_id)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("sync run {run_id}")))?;

        let counts: Vec<(String, i64)> = sync_tracking::Entity::find()
            .select_only()
            .column(sync_tracking::Column::Status)
            .column_as(Expr::col(sync_tracking::Column::Id).count(), "count")
            .filter(sync_tracking::Column::RunId.eq(run_id))
            .group_by(sync_tracking::Column::Status)
            .into_tuple()
            .all(&self.db)
            .await?;

        let mut summary = RunSummary {
            run_id: run.id,
            status: run.status,
            total_items: run.total_items,
            ..RunSummary::default()
        };

        for (status, count) in counts {
            let count = count.max(0) as u64;
            match status.parse::<TrackingStatus>() {
                Ok(TrackingStatus::Pending) => summary.pending = count,
                Ok(TrackingStatus::Processing) => summary.processing = count,
                Ok(TrackingStatus::Completed) => summary.completed = count,
                Ok(TrackingStatus::Failed) => summary.failed = count,
                Err(e) => tracing::warn!(run_id = %run_id, error = %e, "Skipping unknown status"),
            }
        }

        Ok(summary)
    }
}
