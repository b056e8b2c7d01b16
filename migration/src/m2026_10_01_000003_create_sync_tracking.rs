//! Migration to create the sync_tracking table.
//!
//! Per-entity sync state keyed by (entity_type, shop_id, remote_id). The
//! attempt counter lives here and nowhere else.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncTracking::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncTracking::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncTracking::EntityType).text().not_null())
                    .col(ColumnDef::new(SyncTracking::ShopId).text().not_null())
                    .col(ColumnDef::new(SyncTracking::RemoteId).text().not_null())
                    .col(ColumnDef::new(SyncTracking::LocalId).text().null())
                    .col(ColumnDef::new(SyncTracking::RunId).text().null())
                    .col(
                        ColumnDef::new(SyncTracking::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(SyncTracking::LastError).text().null())
                    .col(
                        ColumnDef::new(SyncTracking::LastAttemptAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncTracking::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncTracking::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncTracking::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_tracking_entity_unique")
                    .table(SyncTracking::Table)
                    .col(SyncTracking::EntityType)
                    .col(SyncTracking::ShopId)
                    .col(SyncTracking::RemoteId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_tracking_run_status")
                    .table(SyncTracking::Table)
                    .col(SyncTracking::RunId)
                    .col(SyncTracking::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_tracking_entity_unique")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_sync_tracking_run_status").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SyncTracking::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncTracking {
    Table,
    Id,
    EntityType,
    ShopId,
    RemoteId,
    LocalId,
    RunId,
    Status,
    LastError,
    LastAttemptAt,
    Attempts,
    CreatedAt,
    UpdatedAt,
}
