//! SyncTracking entity model
//!
//! Per-entity sync state, unique on (entity_type, shop_id, remote_id).

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

use super::{TrackingStatus, UnknownVariant};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_tracking")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub entity_type: String,

    pub shop_id: String,

    pub remote_id: String,

    /// Local mirror id, set once the payload has been applied
    pub local_id: Option<String>,

    /// Run currently owning this entity
    pub run_id: Option<String>,

    pub status: String,

    pub last_error: Option<String>,

    pub last_attempt_at: Option<DateTimeWithTimeZone>,

    /// Failed attempts within the owning run
    pub attempts: i32,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn tracking_status(&self) -> Result<TrackingStatus, UnknownVariant> {
        self.status.parse()
    }
}
