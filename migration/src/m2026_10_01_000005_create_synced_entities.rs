//! Migration to create the synced_entities table, the local mirror of
//! products and orders pulled from the vendor.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncedEntities::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncedEntities::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncedEntities::EntityType).text().not_null())
                    .col(ColumnDef::new(SyncedEntities::ShopId).text().not_null())
                    .col(ColumnDef::new(SyncedEntities::RemoteId).text().not_null())
                    .col(ColumnDef::new(SyncedEntities::Payload).json_binary().not_null())
                    .col(
                        ColumnDef::new(SyncedEntities::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(SyncedEntities::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncedEntities::UpdatedAt)
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
                    .name("idx_synced_entities_remote_unique")
                    .table(SyncedEntities::Table)
                    .col(SyncedEntities::EntityType)
                    .col(SyncedEntities::ShopId)
                    .col(SyncedEntities::RemoteId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_synced_entities_remote_unique")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(SyncedEntities::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncedEntities {
    Table,
    Id,
    EntityType,
    ShopId,
    RemoteId,
    Payload,
    Status,
    CreatedAt,
    UpdatedAt,
}
