//! SyncedEntity entity model: the local mirror of vendor products and orders.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "synced_entities")]
pub struct Model {
    /// Doubles as the stable local id handed back to the tracking store
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub entity_type: String,

    pub shop_id: String,

    pub remote_id: String,

    /// Last vendor payload applied
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// `active`, `cancelled` or `deleted`
    pub status: String,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
