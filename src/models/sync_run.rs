//! SyncRun entity model
//!
//! One row per scheduled synchronization run over a fixed set of remote ids.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

use super::{RunStatus, UnknownVariant};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_runs")]
pub struct Model {
    /// Opaque run identifier (`run_<uuid>`)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub shop_id: String,

    /// `product` or `order`
    pub entity_type: String,

    /// Number of unique remote ids, fixed at creation
    pub total_items: i32,

    pub status: String,

    /// Actor that requested the run (operator, webhook, periodic, resume)
    pub initiated_by: String,

    /// Original run when this run resumes a paused one
    pub parent_run_id: Option<String>,

    pub last_error: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,

    pub finished_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::sync_batch::Entity")]
    Batches,
}

impl Related<super::sync_batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Batches.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn run_status(&self) -> Result<RunStatus, UnknownVariant> {
        self.status.parse()
    }
}
