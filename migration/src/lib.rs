//! Database migrations for the printsync service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_10_01_000001_create_sync_runs;
mod m2026_10_01_000002_create_sync_batches;
mod m2026_10_01_000003_create_sync_tracking;
mod m2026_10_01_000004_create_scheduled_jobs;
mod m2026_10_01_000005_create_synced_entities;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_10_01_000001_create_sync_runs::Migration),
            Box::new(m2026_10_01_000002_create_sync_batches::Migration),
            Box::new(m2026_10_01_000003_create_sync_tracking::Migration),
            Box::new(m2026_10_01_000004_create_scheduled_jobs::Migration),
            Box::new(m2026_10_01_000005_create_synced_entities::Migration),
        ]
    }
}
