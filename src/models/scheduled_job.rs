//! ScheduledJob entity model
//!
//! This module contains the SeaORM entity model for the scheduled_jobs table,
//! the deferred work queue drained by the job runner.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Job that processes one batch. Payload: `{"batch_id": ...}`.
pub const PROCESS_BATCH: &str = "sync.process_batch";
/// Job that tidies a finished run. Payload: `{"run_id": ...}`.
pub const CLEANUP_RUN: &str = "sync.cleanup_run";

/// Deferred unit of work
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "scheduled_jobs")]
pub struct Model {
    /// Unique identifier for the job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Handler name, matched by the runner
    pub job_name: String,

    /// Grouping key used to unschedule related jobs together (the run id)
    pub group_key: String,

    /// Handler arguments
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// Earliest time the job may be claimed
    pub run_at: DateTimeWithTimeZone,

    /// Current status of the job (queued, running, completed, failed, cancelled)
    pub status: String,

    /// Number of times the job has been claimed
    pub attempts: i32,

    /// Timestamp when the job started execution
    pub started_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the job finished execution
    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Failure message if the handler returned an error
    pub error: Option<String>,

    /// Timestamp when the job was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the job was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// String field from the payload, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|value| value.as_str())
    }
}
