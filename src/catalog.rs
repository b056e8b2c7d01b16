//! Local persistence of vendor state.
//!
//! The worker and the webhook ingestor only talk to [`LocalCatalog`].
//! [`MirrorCatalog`] keeps the last applied payload per entity in the
//! `synced_entities` table.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::synced_entity::{self, Column, Entity};
use crate::models::{EntityType, MirrorStatus};

/// Why a payload could not be applied locally.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApplyError {
    /// The payload itself is unusable; retrying will not help
    #[error("payload rejected: {0}")]
    Rejected(String),
    /// Local storage is failing
    #[error("local storage failure: {0}")]
    Storage(String),
}

impl From<ApplyError> for SyncError {
    fn from(error: ApplyError) -> Self {
        match error {
            ApplyError::Rejected(_) => SyncError::permanent(error.to_string()),
            ApplyError::Storage(_) => SyncError::critical(error.to_string()),
        }
    }
}

impl From<sea_orm::DbErr> for ApplyError {
    fn from(error: sea_orm::DbErr) -> Self {
        tracing::error!(error = %error, "Catalog write failed");
        ApplyError::Storage(error.to_string())
    }
}

/// Where synchronized products and orders end up.
#[async_trait]
pub trait LocalCatalog: Send + Sync {
    /// Creates or updates the local entity and returns its local id.
    async fn apply(
        &self,
        shop_id: &str,
        entity_type: EntityType,
        remote_id: &str,
        payload: &JsonValue,
    ) -> Result<String, ApplyError>;

    /// Marks a local order cancelled. `payload` is the webhook data, if any.
    async fn cancel_order(
        &self,
        shop_id: &str,
        remote_id: &str,
        payload: &JsonValue,
    ) -> Result<(), ApplyError>;

    /// Removes a product from the local catalog.
    async fn delete_product(&self, shop_id: &str, remote_id: &str) -> Result<(), ApplyError>;
}

/// `synced_entities`-backed catalog.
#[derive(Clone)]
pub struct MirrorCatalog {
    db: DatabaseConnection,
}

impl MirrorCatalog {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn find(
        &self,
        shop_id: &str,
        entity_type: EntityType,
        remote_id: &str,
    ) -> Result<Option<synced_entity::Model>, ApplyError> {
        Ok(Entity::find()
            .filter(Column::EntityType.eq(entity_type.as_str()))
            .filter(Column::ShopId.eq(shop_id))
            .filter(Column::RemoteId.eq(remote_id))
            .one(&self.db)
            .await?)
    }

    /// Sets the status of an existing row, or records a placeholder row when
    /// the entity was never mirrored.
    async fn set_status(
        &self,
        shop_id: &str,
        entity_type: EntityType,
        remote_id: &str,
        status: MirrorStatus,
        payload: &JsonValue,
    ) -> Result<(), ApplyError> {
        let now = Utc::now().fixed_offset();

        let updated = Entity::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::EntityType.eq(entity_type.as_str()))
            .filter(Column::ShopId.eq(shop_id))
            .filter(Column::RemoteId.eq(remote_id))
            .exec(&self.db)
            .await?;

        if updated.rows_affected == 0 {
            tracing::debug!(
                shop_id = %shop_id,
                remote_id = %remote_id,
                status = %status,
                "Recording status for entity not yet mirrored"
            );
            self.upsert(shop_id, entity_type, remote_id, payload, status)
                .await?;
        }

        Ok(())
    }

    async fn upsert(
        &self,
        shop_id: &str,
        entity_type: EntityType,
        remote_id: &str,
        payload: &JsonValue,
        status: MirrorStatus,
    ) -> Result<String, ApplyError> {
        let now = Utc::now().fixed_offset();

        let row = synced_entity::ActiveModel {
            id: Set(Uuid::new_v4()),
            entity_type: Set(entity_type.as_str().to_string()),
            shop_id: Set(shop_id.to_string()),
            remote_id: Set(remote_id.to_string()),
            payload: Set(payload.clone()),
            status: Set(status.as_str().to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        // The id column is left out of the update so the local id stays stable.
        Entity::insert(row)
            .on_conflict(
                OnConflict::columns([Column::EntityType, Column::ShopId, Column::RemoteId])
                    .update_columns([Column::Payload, Column::Status, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        let stored = self
            .find(shop_id, entity_type, remote_id)
            .await?
            .ok_or_else(|| ApplyError::Storage("mirrored row missing after upsert".into()))?;

        Ok(stored.id.to_string())
    }
}

#[async_trait]
impl LocalCatalog for MirrorCatalog {
    async fn apply(
        &self,
        shop_id: &str,
        entity_type: EntityType,
        remote_id: &str,
        payload: &JsonValue,
    ) -> Result<String, ApplyError> {
        if !payload.is_object() {
            return Err(ApplyError::Rejected(format!(
                "{entity_type} {remote_id}: payload is not an object"
            )));
        }
        if let Some(payload_id) = payload.get("id").and_then(|v| v.as_str())
            && payload_id != remote_id
        {
            return Err(ApplyError::Rejected(format!(
                "{entity_type} {remote_id}: payload carries id {payload_id}"
            )));
        }

        let local_id = self
            .upsert(shop_id, entity_type, remote_id, payload, MirrorStatus::Active)
            .await?;

        tracing::debug!(
            shop_id = %shop_id,
            entity_type = %entity_type,
            remote_id = %remote_id,
            local_id = %local_id,
            "Applied vendor payload"
        );

        Ok(local_id)
    }

    async fn cancel_order(
        &self,
        shop_id: &str,
        remote_id: &str,
        payload: &JsonValue,
    ) -> Result<(), ApplyError> {
        self.set_status(
            shop_id,
            EntityType::Order,
            remote_id,
            MirrorStatus::Cancelled,
            payload,
        )
        .await?;
        tracing::info!(shop_id = %shop_id, remote_id = %remote_id, "Order cancelled locally");
        Ok(())
    }

    async fn delete_product(&self, shop_id: &str, remote_id: &str) -> Result<(), ApplyError> {
        self.set_status(
            shop_id,
            EntityType::Product,
            remote_id,
            MirrorStatus::Deleted,
            &JsonValue::Null,
        )
        .await?;
        tracing::info!(shop_id = %shop_id, remote_id = %remote_id, "Product deleted locally");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;
    use serde_json::json;

    async fn catalog() -> MirrorCatalog {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        MirrorCatalog::new(db)
    }

    #[tokio::test]
    async fn apply_keeps_local_id_stable_across_updates() {
        let catalog = catalog().await;

        let first = catalog
            .apply("shop", EntityType::Product, "p1", &json!({"title": "Mug"}))
            .await
            .unwrap();
        let second = catalog
            .apply("shop", EntityType::Product, "p1", &json!({"title": "Mug v2"}))
            .await
            .unwrap();

        assert_eq!(first, second);
        let row = catalog
            .find("shop", EntityType::Product, "p1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.payload["title"], "Mug v2");
        assert_eq!(row.status, "active");
    }

    #[tokio::test]
    async fn apply_rejects_non_object_and_mismatched_payloads() {
        let catalog = catalog().await;

        let err = catalog
            .apply("shop", EntityType::Order, "o1", &json!(["nope"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::Rejected(_)));
        assert_eq!(SyncError::from(err).class(), ErrorClass::Permanent);

        let err = catalog
            .apply("shop", EntityType::Order, "o1", &json!({"id": "o2"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::Rejected(_)));
    }

    #[tokio::test]
    async fn cancel_and_delete_update_status() {
        let catalog = catalog().await;
        catalog
            .apply("shop", EntityType::Order, "o1", &json!({"id": "o1"}))
            .await
            .unwrap();

        catalog
            .cancel_order("shop", "o1", &json!({"reason": "customer"}))
            .await
            .unwrap();
        catalog.delete_product("shop", "p-unknown").await.unwrap();

        let order = catalog
            .find("shop", EntityType::Order, "o1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, "cancelled");
        assert_eq!(order.payload["id"], "o1");

        let product = catalog
            .find("shop", EntityType::Product, "p-unknown")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(product.status, "deleted");
    }

    #[test]
    fn storage_errors_are_critical() {
        let err: SyncError = ApplyError::Storage("disk full".into()).into();
        assert_eq!(err.class(), ErrorClass::Critical);
    }
}
