//! Migration to create the sync_runs table.
//!
//! One row per scheduled synchronization run: shop, entity type, fixed item
//! total and a forward-only status.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncRuns::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncRuns::Id).text().not_null().primary_key())
                    .col(ColumnDef::new(SyncRuns::ShopId).text().not_null())
                    .col(ColumnDef::new(SyncRuns::EntityType).text().not_null())
                    .col(ColumnDef::new(SyncRuns::TotalItems).integer().not_null())
                    .col(
                        ColumnDef::new(SyncRuns::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(SyncRuns::InitiatedBy).text().not_null())
                    .col(ColumnDef::new(SyncRuns::ParentRunId).text().null())
                    .col(ColumnDef::new(SyncRuns::LastError).text().null())
                    .col(
                        ColumnDef::new(SyncRuns::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncRuns::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncRuns::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_runs_shop_status")
                    .table(SyncRuns::Table)
                    .col(SyncRuns::ShopId)
                    .col(SyncRuns::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_sync_runs_shop_status").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SyncRuns::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncRuns {
    Table,
    Id,
    ShopId,
    EntityType,
    TotalItems,
    Status,
    InitiatedBy,
    ParentRunId,
    LastError,
    CreatedAt,
    UpdatedAt,
    FinishedAt,
}
