//! Test utilities shared by the integration tests.
//!
//! In-memory SQLite with migrations, a scripted vendor, a recording notifier
//! and a helper that wires the full pipeline around them.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use migration::{Migrator, MigratorTrait};
use printsync::catalog::MirrorCatalog;
use printsync::config::AppConfig;
use printsync::error::SyncError;
use printsync::models::EntityType;
use printsync::notify::{Notifier, NotifyError, OperatorAlert};
use printsync::optimizer::{LoadSample, StaticLoadSampler};
use printsync::pipeline::{Collaborators, Pipeline};
use printsync::vendor::VendorClient;
use sea_orm::{Database, DatabaseConnection};
use serde_json::{Value as JsonValue, json};

pub const SHOP: &str = "shop-1";
pub const WEBHOOK_SECRET: &str = "whsec_integration";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Configuration used by pipeline tests.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        profile: "test".to_string(),
        ..AppConfig::default()
    };
    config.webhook.secret = Some(WEBHOOK_SECRET.to_string());
    config.vendor.default_shop_id = Some(SHOP.to_string());
    config
}

pub fn ids(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|id| id.to_string()).collect()
}

/// Numbered ids `p1..=pN`.
pub fn product_ids(count: usize) -> Vec<String> {
    (1..=count).map(|n| format!("p{n}")).collect()
}

/// What the scripted vendor does for one remote id.
#[derive(Clone)]
pub enum Scripted {
    Fail(SyncError),
    Hang(Duration),
}

/// Vendor returning `{"id": remote_id}` unless a script says otherwise.
#[derive(Default)]
pub struct ScriptedVendor {
    scripts: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<Vec<String>>,
    listing: Mutex<Vec<String>>,
}

impl ScriptedVendor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, remote_id: &str, behaviour: Scripted) {
        self.scripts
            .lock()
            .unwrap()
            .insert(remote_id.to_string(), behaviour);
    }

    pub fn fail(&self, remote_id: &str, error: SyncError) {
        self.script(remote_id, Scripted::Fail(error));
    }

    pub fn set_listing(&self, ids: Vec<String>) {
        *self.listing.lock().unwrap() = ids;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, remote_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == remote_id)
            .count()
    }
}

#[async_trait]
impl VendorClient for ScriptedVendor {
    async fn fetch_entity(
        &self,
        _shop_id: &str,
        _entity_type: EntityType,
        remote_id: &str,
    ) -> Result<JsonValue, SyncError> {
        self.calls.lock().unwrap().push(remote_id.to_string());
        let scripted = self.scripts.lock().unwrap().get(remote_id).cloned();
        match scripted {
            Some(Scripted::Fail(error)) => Err(error),
            Some(Scripted::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(json!({ "id": remote_id }))
            }
            None => Ok(json!({ "id": remote_id, "title": format!("Item {remote_id}") })),
        }
    }

    async fn list_entity_ids(
        &self,
        _shop_id: &str,
        _entity_type: EntityType,
    ) -> Result<Vec<String>, SyncError> {
        Ok(self.listing.lock().unwrap().clone())
    }
}

/// Notifier that keeps every alert.
#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<OperatorAlert>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<OperatorAlert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: &OperatorAlert) -> Result<(), NotifyError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

pub fn idle_load() -> LoadSample {
    LoadSample {
        load_ratio: 0.1,
        memory_ratio: 0.1,
    }
}

pub fn overloaded() -> LoadSample {
    LoadSample {
        load_ratio: 0.1,
        memory_ratio: 0.95,
    }
}

/// A fully wired pipeline plus handles on its fakes.
pub struct Harness {
    pub db: DatabaseConnection,
    pub config: AppConfig,
    pub pipeline: Pipeline,
    pub vendor: Arc<ScriptedVendor>,
    pub notifier: Arc<RecordingNotifier>,
    pub catalog: Arc<MirrorCatalog>,
}

impl Harness {
    pub async fn new() -> Result<Self> {
        Self::with(test_config(), idle_load()).await
    }

    pub async fn with(config: AppConfig, load: LoadSample) -> Result<Self> {
        let db = setup_test_db().await?;
        let vendor = ScriptedVendor::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let catalog = Arc::new(MirrorCatalog::new(db.clone()));

        let pipeline = Pipeline::build(
            db.clone(),
            &config,
            Collaborators {
                vendor: vendor.clone(),
                catalog: catalog.clone(),
                notifier: notifier.clone(),
                sampler: Arc::new(StaticLoadSampler(load)),
            },
        );

        Ok(Self {
            db,
            config,
            pipeline,
            vendor,
            notifier,
            catalog,
        })
    }
}
