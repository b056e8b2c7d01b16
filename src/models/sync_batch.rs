//! SyncBatch entity model
//!
//! A chunk of a run's entity ids handed to the worker as one deferred job.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

use super::{BatchStatus, UnknownVariant};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_batches")]
pub struct Model {
    /// Derived from the run id and sequence, see [`import_batch_id`]
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub run_id: String,

    /// Position of the batch within its run
    pub seq: i32,

    /// `import`, `retry` or `webhook`
    pub kind: String,

    /// Ordered JSON array of remote ids
    #[sea_orm(column_type = "JsonBinary")]
    pub entity_ids: JsonValue,

    /// Chunk size the scheduler picked for the run
    pub chunk_size: i32,

    pub scheduled_at: DateTimeWithTimeZone,

    pub status: String,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::sync_run::Entity",
        from = "Column::RunId",
        to = "super::sync_run::Column::Id"
    )]
    Run,
}

impl Related<super::sync_run::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Run.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Remote ids in scheduling order. Non-string entries are skipped.
    pub fn entity_id_list(&self) -> Vec<String> {
        self.entity_ids
            .as_array()
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn batch_status(&self) -> Result<BatchStatus, UnknownVariant> {
        self.status.parse()
    }
}

/// Identifier of the `index`th import chunk of a run.
pub fn import_batch_id(run_id: &str, index: usize) -> String {
    format!("{run_id}:{index:04}")
}

/// Identifier of a single-entity retry batch.
pub fn retry_batch_id(run_id: &str, remote_id: &str, attempt: i32) -> String {
    format!("{run_id}:retry:{remote_id}:{attempt}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_ids_are_deterministic_and_distinct() {
        assert_eq!(import_batch_id("run_abc", 2), "run_abc:0002");
        assert_eq!(retry_batch_id("run_abc", "p-9", 1), "run_abc:retry:p-9:1");
        assert_ne!(import_batch_id("run_abc", 1), import_batch_id("run_abc", 10));
    }
}
