//! Migration to create the sync_batches table.
//!
//! Batches are the chunks of a run handed to the worker, one deferred job each.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncBatches::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncBatches::Id)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncBatches::RunId).text().not_null())
                    .col(ColumnDef::new(SyncBatches::Seq).integer().not_null())
                    .col(ColumnDef::new(SyncBatches::Kind).text().not_null())
                    .col(ColumnDef::new(SyncBatches::EntityIds).json_binary().not_null())
                    .col(ColumnDef::new(SyncBatches::ChunkSize).integer().not_null())
                    .col(
                        ColumnDef::new(SyncBatches::ScheduledAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncBatches::Status)
                            .text()
                            .not_null()
                            .default("scheduled"),
                    )
                    .col(
                        ColumnDef::new(SyncBatches::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncBatches::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_batches_run_id")
                            .from(SyncBatches::Table, SyncBatches::RunId)
                            .to(SyncRuns::Table, SyncRuns::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_batches_run_status")
                    .table(SyncBatches::Table)
                    .col(SyncBatches::RunId)
                    .col(SyncBatches::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_sync_batches_run_status").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SyncBatches::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncBatches {
    Table,
    Id,
    RunId,
    Seq,
    Kind,
    EntityIds,
    ChunkSize,
    ScheduledAt,
    Status,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum SyncRuns {
    Table,
    Id,
}
