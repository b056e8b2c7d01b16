//! Configuration loading for the printsync service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `PRINTSYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "PRINTSYNC_";
const REDACTED: &str = "[REDACTED]";

/// Application configuration derived from `PRINTSYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default)]
    pub vendor: VendorConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
}

/// Connection settings for the print-on-demand vendor REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct VendorConfig {
    /// Base URL every endpoint is joined onto (`PRINTSYNC_VENDOR_API_BASE`)
    #[serde(default = "default_vendor_api_base")]
    pub api_base: String,
    /// Bearer token sent with every request (`PRINTSYNC_VENDOR_API_TOKEN`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_vendor_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Extra tries for transient failures inside a single call
    #[serde(default = "default_vendor_max_retries")]
    pub max_retries: u32,
    /// Starting backoff between in-call retries
    #[serde(default = "default_vendor_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Shop used when a webhook omits `shop_id` and by the periodic trigger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_shop_id: Option<String>,
}

/// Webhook ingestion settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WebhookConfig {
    /// Shared HMAC secret (`PRINTSYNC_WEBHOOK_SECRET`). Without it every
    /// delivery is rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Scheduling and retry policy for sync runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncConfig {
    #[serde(default = "default_sync_min_chunk")]
    pub min_chunk: usize,
    #[serde(default = "default_sync_max_chunk")]
    pub max_chunk: usize,
    #[serde(default = "default_sync_default_chunk")]
    pub default_chunk: usize,
    /// Delay between consecutive batches of one run
    #[serde(default = "default_sync_stagger_interval_seconds")]
    pub stagger_interval_seconds: u64,
    #[serde(default = "default_sync_cleanup_delay_seconds")]
    pub cleanup_delay_seconds: u64,
    #[serde(default = "default_sync_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    /// Ceiling on a vendor-supplied `Retry-After`
    #[serde(default = "default_sync_max_retry_after_seconds")]
    pub max_retry_after_seconds: u64,
    /// Failed attempts allowed per entity and run before it is marked failed
    #[serde(default = "default_sync_max_retries")]
    pub max_retries: i32,
    /// Postponement applied to new runs and claimed batches while the host is overloaded
    #[serde(default = "default_sync_throttle_delay_seconds")]
    pub throttle_delay_seconds: u64,
    #[serde(default = "default_sync_product_settle_seconds")]
    pub product_settle_seconds: u64,
    #[serde(default = "default_sync_order_settle_seconds")]
    pub order_settle_seconds: u64,
    /// Upper bound on a single vendor fetch made by the worker
    #[serde(default = "default_sync_fetch_timeout_seconds")]
    pub fetch_timeout_seconds: u64,
    #[serde(default = "default_sync_tracking_retention_days")]
    pub tracking_retention_days: i64,
}

/// Adaptive batch sizing and throttling thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct OptimizerConfig {
    #[serde(default = "default_optimizer_grow_success_rate")]
    pub grow_success_rate: f64,
    #[serde(default = "default_optimizer_grow_max_load")]
    pub grow_max_load: f64,
    #[serde(default = "default_optimizer_shrink_error_rate")]
    pub shrink_error_rate: f64,
    #[serde(default = "default_optimizer_shrink_min_load")]
    pub shrink_min_load: f64,
    #[serde(default = "default_optimizer_grow_factor")]
    pub grow_factor: f64,
    #[serde(default = "default_optimizer_shrink_factor")]
    pub shrink_factor: f64,
    #[serde(default = "default_optimizer_metrics_window_seconds")]
    pub metrics_window_seconds: i64,
    /// Memory budget the process RSS is compared against
    #[serde(default = "default_optimizer_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default = "default_optimizer_throttle_memory_ratio")]
    pub throttle_memory_ratio: f64,
    #[serde(default = "default_optimizer_throttle_load_ratio")]
    pub throttle_load_ratio: f64,
}

/// Deferred job runner parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RunnerConfig {
    #[serde(default = "default_runner_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_runner_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_runner_claim_batch")]
    pub claim_batch: u64,
    /// Claims allowed per job before a failing job is given up on
    #[serde(default = "default_runner_max_job_attempts")]
    pub max_job_attempts: i32,
    #[serde(default = "default_runner_job_retry_base_seconds")]
    pub job_retry_base_seconds: u64,
    /// A job still `running` after this long is assumed orphaned and reclaimed
    #[serde(default = "default_runner_job_lease_seconds")]
    pub job_lease_seconds: u64,
}

/// Operator notification channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct NotifyConfig {
    /// HTTPS endpoint receiving pause notifications; log-only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_webhook_url: Option<String>,
}

/// Periodic full-sync trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TriggerConfig {
    /// Seconds between full product syncs; 0 disables the trigger
    #[serde(default)]
    pub full_sync_interval_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            vendor: VendorConfig::default(),
            webhook: WebhookConfig::default(),
            sync: SyncConfig::default(),
            optimizer: OptimizerConfig::default(),
            runner: RunnerConfig::default(),
            notify: NotifyConfig::default(),
            trigger: TriggerConfig::default(),
        }
    }
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            api_base: default_vendor_api_base(),
            api_token: None,
            timeout_seconds: default_vendor_timeout_seconds(),
            max_retries: default_vendor_max_retries(),
            retry_base_ms: default_vendor_retry_base_ms(),
            default_shop_id: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_chunk: default_sync_min_chunk(),
            max_chunk: default_sync_max_chunk(),
            default_chunk: default_sync_default_chunk(),
            stagger_interval_seconds: default_sync_stagger_interval_seconds(),
            cleanup_delay_seconds: default_sync_cleanup_delay_seconds(),
            retry_delay_seconds: default_sync_retry_delay_seconds(),
            max_retry_after_seconds: default_sync_max_retry_after_seconds(),
            max_retries: default_sync_max_retries(),
            throttle_delay_seconds: default_sync_throttle_delay_seconds(),
            product_settle_seconds: default_sync_product_settle_seconds(),
            order_settle_seconds: default_sync_order_settle_seconds(),
            fetch_timeout_seconds: default_sync_fetch_timeout_seconds(),
            tracking_retention_days: default_sync_tracking_retention_days(),
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            grow_success_rate: default_optimizer_grow_success_rate(),
            grow_max_load: default_optimizer_grow_max_load(),
            shrink_error_rate: default_optimizer_shrink_error_rate(),
            shrink_min_load: default_optimizer_shrink_min_load(),
            grow_factor: default_optimizer_grow_factor(),
            shrink_factor: default_optimizer_shrink_factor(),
            metrics_window_seconds: default_optimizer_metrics_window_seconds(),
            memory_limit_mb: default_optimizer_memory_limit_mb(),
            throttle_memory_ratio: default_optimizer_throttle_memory_ratio(),
            throttle_load_ratio: default_optimizer_throttle_load_ratio(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_runner_tick_ms(),
            concurrency: default_runner_concurrency(),
            claim_batch: default_runner_claim_batch(),
            max_job_attempts: default_runner_max_job_attempts(),
            job_retry_base_seconds: default_runner_job_retry_base_seconds(),
            job_lease_seconds: default_runner_job_lease_seconds(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.vendor.api_token.is_some() {
            config.vendor.api_token = Some(REDACTED.to_string());
        }
        if config.webhook.secret.is_some() {
            config.webhook.secret = Some(REDACTED.to_string());
        }
        if config.notify.operator_webhook_url.is_some() {
            config.notify.operator_webhook_url = Some(REDACTED.to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Outside local/test the service must be able to talk to the vendor and
        // authenticate its webhooks.
        if !matches!(self.profile.as_str(), "local" | "test") {
            if self.vendor.api_token.is_none() {
                return Err(ConfigError::MissingVendorToken);
            }
            if self.webhook.secret.is_none() {
                return Err(ConfigError::MissingWebhookSecret);
            }
        }

        self.vendor.validate()?;
        self.sync.validate()?;
        self.optimizer.validate()?;
        self.runner.validate()?;
        self.notify.validate()?;

        Ok(())
    }
}

impl VendorConfig {
    /// Validate vendor connection settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let parsed = url::Url::parse(&self.api_base).map_err(|e| ConfigError::InvalidUrl {
            field: "VENDOR_API_BASE".to_string(),
            value: self.api_base.clone(),
            error: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl {
                field: "VENDOR_API_BASE".to_string(),
                value: self.api_base.clone(),
                error: "scheme must be http or https".to_string(),
            });
        }
        if self.timeout_seconds == 0 {
            return Err(ConfigError::InvalidVendorTimeout {
                value: self.timeout_seconds,
            });
        }
        Ok(())
    }
}

impl SyncConfig {
    /// Validate chunk bounds and retry policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_chunk == 0 || self.min_chunk > self.max_chunk {
            return Err(ConfigError::InvalidChunkBounds {
                min: self.min_chunk,
                max: self.max_chunk,
            });
        }
        if self.default_chunk < self.min_chunk || self.default_chunk > self.max_chunk {
            return Err(ConfigError::InvalidDefaultChunk {
                value: self.default_chunk,
                min: self.min_chunk,
                max: self.max_chunk,
            });
        }
        if self.max_retries <= 0 {
            return Err(ConfigError::InvalidMaxRetries {
                value: self.max_retries,
            });
        }
        if self.max_retry_after_seconds < self.retry_delay_seconds {
            return Err(ConfigError::InvalidRetryAfterCap {
                value: self.max_retry_after_seconds,
                retry_delay: self.retry_delay_seconds,
            });
        }
        if self.fetch_timeout_seconds == 0 {
            return Err(ConfigError::InvalidFetchTimeout {
                value: self.fetch_timeout_seconds,
            });
        }
        if self.tracking_retention_days <= 0 {
            return Err(ConfigError::InvalidRetention {
                value: self.tracking_retention_days,
            });
        }
        Ok(())
    }
}

impl OptimizerConfig {
    /// Validate ratio thresholds and scaling factors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratios = [
            ("OPTIMIZER_GROW_SUCCESS_RATE", self.grow_success_rate),
            ("OPTIMIZER_GROW_MAX_LOAD", self.grow_max_load),
            ("OPTIMIZER_SHRINK_ERROR_RATE", self.shrink_error_rate),
            ("OPTIMIZER_SHRINK_MIN_LOAD", self.shrink_min_load),
            ("OPTIMIZER_THROTTLE_MEMORY_RATIO", self.throttle_memory_ratio),
            ("OPTIMIZER_THROTTLE_LOAD_RATIO", self.throttle_load_ratio),
        ];
        for (field, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidRatio {
                    field: field.to_string(),
                    value,
                });
            }
        }
        if self.grow_factor < 1.0 {
            return Err(ConfigError::InvalidScaleFactor {
                field: "OPTIMIZER_GROW_FACTOR".to_string(),
                value: self.grow_factor,
            });
        }
        if self.shrink_factor <= 0.0 || self.shrink_factor > 1.0 {
            return Err(ConfigError::InvalidScaleFactor {
                field: "OPTIMIZER_SHRINK_FACTOR".to_string(),
                value: self.shrink_factor,
            });
        }
        if self.metrics_window_seconds <= 0 {
            return Err(ConfigError::InvalidMetricsWindow {
                value: self.metrics_window_seconds,
            });
        }
        if self.memory_limit_mb == 0 {
            return Err(ConfigError::InvalidMemoryLimit {
                value: self.memory_limit_mb,
            });
        }
        Ok(())
    }
}

impl RunnerConfig {
    /// Validate runner bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_ms < 100 || self.tick_ms > 60_000 {
            return Err(ConfigError::InvalidRunnerTick { value: self.tick_ms });
        }
        if self.concurrency == 0 || self.concurrency > 64 {
            return Err(ConfigError::InvalidRunnerConcurrency {
                value: self.concurrency,
            });
        }
        if self.claim_batch == 0 {
            return Err(ConfigError::InvalidRunnerClaimBatch {
                value: self.claim_batch,
            });
        }
        if self.max_job_attempts < 1 {
            return Err(ConfigError::InvalidRunnerJobAttempts {
                value: self.max_job_attempts,
            });
        }
        if self.job_lease_seconds == 0 {
            return Err(ConfigError::InvalidRunnerJobLease {
                value: self.job_lease_seconds,
            });
        }
        Ok(())
    }
}

impl NotifyConfig {
    /// Operator webhooks must be HTTPS.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(raw) = &self.operator_webhook_url {
            let parsed = url::Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
                field: "NOTIFY_OPERATOR_WEBHOOK_URL".to_string(),
                value: raw.clone(),
                error: e.to_string(),
            })?;
            if parsed.scheme() != "https" {
                return Err(ConfigError::InvalidUrl {
                    field: "NOTIFY_OPERATOR_WEBHOOK_URL".to_string(),
                    value: raw.clone(),
                    error: "operator webhook must use https".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://printsync.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_vendor_api_base() -> String {
    "https://api.printify.com/v1/".to_string()
}

fn default_vendor_timeout_seconds() -> u64 {
    30
}

fn default_vendor_max_retries() -> u32 {
    2
}

fn default_vendor_retry_base_ms() -> u64 {
    500
}

fn default_sync_min_chunk() -> usize {
    5
}

fn default_sync_max_chunk() -> usize {
    50
}

fn default_sync_default_chunk() -> usize {
    10
}

fn default_sync_stagger_interval_seconds() -> u64 {
    60
}

fn default_sync_cleanup_delay_seconds() -> u64 {
    3600
}

fn default_sync_retry_delay_seconds() -> u64 {
    900
}

fn default_sync_max_retry_after_seconds() -> u64 {
    86_400
}

fn default_sync_max_retries() -> i32 {
    3
}

fn default_sync_throttle_delay_seconds() -> u64 {
    300
}

fn default_sync_product_settle_seconds() -> u64 {
    30
}

fn default_sync_order_settle_seconds() -> u64 {
    10
}

fn default_sync_fetch_timeout_seconds() -> u64 {
    30
}

fn default_sync_tracking_retention_days() -> i64 {
    30
}

fn default_optimizer_grow_success_rate() -> f64 {
    0.95
}

fn default_optimizer_grow_max_load() -> f64 {
    0.70
}

fn default_optimizer_shrink_error_rate() -> f64 {
    0.10
}

fn default_optimizer_shrink_min_load() -> f64 {
    0.80
}

fn default_optimizer_grow_factor() -> f64 {
    1.2
}

fn default_optimizer_shrink_factor() -> f64 {
    0.8
}

fn default_optimizer_metrics_window_seconds() -> i64 {
    3600
}

fn default_optimizer_memory_limit_mb() -> u64 {
    512
}

fn default_optimizer_throttle_memory_ratio() -> f64 {
    0.8
}

fn default_optimizer_throttle_load_ratio() -> f64 {
    0.9
}

fn default_runner_tick_ms() -> u64 {
    1000
}

fn default_runner_concurrency() -> usize {
    4
}

fn default_runner_claim_batch() -> u64 {
    20
}

fn default_runner_max_job_attempts() -> i32 {
    3
}

fn default_runner_job_retry_base_seconds() -> u64 {
    30
}

fn default_runner_job_lease_seconds() -> u64 {
    3600
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("vendor API token is missing; set PRINTSYNC_VENDOR_API_TOKEN")]
    MissingVendorToken,
    #[error("webhook secret is missing; set PRINTSYNC_WEBHOOK_SECRET")]
    MissingWebhookSecret,
    #[error("invalid URL for {field} '{value}': {error}")]
    InvalidUrl {
        field: String,
        value: String,
        error: String,
    },
    #[error("vendor timeout must be positive, got {value}")]
    InvalidVendorTimeout { value: u64 },
    #[error("chunk bounds are invalid (min: {min}, max: {max})")]
    InvalidChunkBounds { min: usize, max: usize },
    #[error("default chunk {value} is outside [{min}, {max}]")]
    InvalidDefaultChunk { value: usize, min: usize, max: usize },
    #[error("max retries must be at least 1, got {value}")]
    InvalidMaxRetries { value: i32 },
    #[error("retry-after cap {value}s is below the retry delay {retry_delay}s")]
    InvalidRetryAfterCap { value: u64, retry_delay: u64 },
    #[error("fetch timeout must be positive, got {value}")]
    InvalidFetchTimeout { value: u64 },
    #[error("tracking retention must be at least 1 day, got {value}")]
    InvalidRetention { value: i64 },
    #[error("{field} must be between 0.0 and 1.0, got {value}")]
    InvalidRatio { field: String, value: f64 },
    #[error("{field} is out of range, got {value}")]
    InvalidScaleFactor { field: String, value: f64 },
    #[error("optimizer metrics window must be positive, got {value}")]
    InvalidMetricsWindow { value: i64 },
    #[error("optimizer memory limit must be positive, got {value}")]
    InvalidMemoryLimit { value: u64 },
    #[error("runner tick must be between 100 and 60000 ms, got {value}")]
    InvalidRunnerTick { value: u64 },
    #[error("runner concurrency must be between 1 and 64, got {value}")]
    InvalidRunnerConcurrency { value: usize },
    #[error("runner claim batch must be positive, got {value}")]
    InvalidRunnerClaimBatch { value: u64 },
    #[error("runner max job attempts must be at least 1, got {value}")]
    InvalidRunnerJobAttempts { value: i32 },
    #[error("runner job lease must be positive, got {value}")]
    InvalidRunnerJobLease { value: u64 },
}

/// Loads configuration using layered `.env` files and `PRINTSYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads, validates and returns the layered configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);

        let vendor = VendorConfig {
            api_base: take_string(&mut layered, "VENDOR_API_BASE")
                .unwrap_or_else(default_vendor_api_base),
            api_token: take_string(&mut layered, "VENDOR_API_TOKEN"),
            timeout_seconds: take_parsed(
                &mut layered,
                "VENDOR_TIMEOUT_SECONDS",
                default_vendor_timeout_seconds,
            )?,
            max_retries: take_parsed(
                &mut layered,
                "VENDOR_MAX_RETRIES",
                default_vendor_max_retries,
            )?,
            retry_base_ms: take_parsed(
                &mut layered,
                "VENDOR_RETRY_BASE_MS",
                default_vendor_retry_base_ms,
            )?,
            default_shop_id: take_string(&mut layered, "VENDOR_DEFAULT_SHOP_ID"),
        };

        let webhook = WebhookConfig {
            secret: take_string(&mut layered, "WEBHOOK_SECRET"),
        };

        let sync = SyncConfig {
            min_chunk: take_parsed(&mut layered, "SYNC_MIN_CHUNK", default_sync_min_chunk)?,
            max_chunk: take_parsed(&mut layered, "SYNC_MAX_CHUNK", default_sync_max_chunk)?,
            default_chunk: take_parsed(
                &mut layered,
                "SYNC_DEFAULT_CHUNK",
                default_sync_default_chunk,
            )?,
            stagger_interval_seconds: take_parsed(
                &mut layered,
                "SYNC_STAGGER_INTERVAL_SECONDS",
                default_sync_stagger_interval_seconds,
            )?,
            cleanup_delay_seconds: take_parsed(
                &mut layered,
                "SYNC_CLEANUP_DELAY_SECONDS",
                default_sync_cleanup_delay_seconds,
            )?,
            retry_delay_seconds: take_parsed(
                &mut layered,
                "SYNC_RETRY_DELAY_SECONDS",
                default_sync_retry_delay_seconds,
            )?,
            max_retry_after_seconds: take_parsed(
                &mut layered,
                "SYNC_MAX_RETRY_AFTER_SECONDS",
                default_sync_max_retry_after_seconds,
            )?,
            max_retries: take_parsed(&mut layered, "SYNC_MAX_RETRIES", default_sync_max_retries)?,
            throttle_delay_seconds: take_parsed(
                &mut layered,
                "SYNC_THROTTLE_DELAY_SECONDS",
                default_sync_throttle_delay_seconds,
            )?,
            product_settle_seconds: take_parsed(
                &mut layered,
                "SYNC_PRODUCT_SETTLE_SECONDS",
                default_sync_product_settle_seconds,
            )?,
            order_settle_seconds: take_parsed(
                &mut layered,
                "SYNC_ORDER_SETTLE_SECONDS",
                default_sync_order_settle_seconds,
            )?,
            fetch_timeout_seconds: take_parsed(
                &mut layered,
                "SYNC_FETCH_TIMEOUT_SECONDS",
                default_sync_fetch_timeout_seconds,
            )?,
            tracking_retention_days: take_parsed(
                &mut layered,
                "SYNC_TRACKING_RETENTION_DAYS",
                default_sync_tracking_retention_days,
            )?,
        };

        let optimizer = OptimizerConfig {
            grow_success_rate: take_parsed(
                &mut layered,
                "OPTIMIZER_GROW_SUCCESS_RATE",
                default_optimizer_grow_success_rate,
            )?,
            grow_max_load: take_parsed(
                &mut layered,
                "OPTIMIZER_GROW_MAX_LOAD",
                default_optimizer_grow_max_load,
            )?,
            shrink_error_rate: take_parsed(
                &mut layered,
                "OPTIMIZER_SHRINK_ERROR_RATE",
                default_optimizer_shrink_error_rate,
            )?,
            shrink_min_load: take_parsed(
                &mut layered,
                "OPTIMIZER_SHRINK_MIN_LOAD",
                default_optimizer_shrink_min_load,
            )?,
            grow_factor: take_parsed(
                &mut layered,
                "OPTIMIZER_GROW_FACTOR",
                default_optimizer_grow_factor,
            )?,
            shrink_factor: take_parsed(
                &mut layered,
                "OPTIMIZER_SHRINK_FACTOR",
                default_optimizer_shrink_factor,
            )?,
            metrics_window_seconds: take_parsed(
                &mut layered,
                "OPTIMIZER_METRICS_WINDOW_SECONDS",
                default_optimizer_metrics_window_seconds,
            )?,
            memory_limit_mb: take_parsed(
                &mut layered,
                "OPTIMIZER_MEMORY_LIMIT_MB",
                default_optimizer_memory_limit_mb,
            )?,
            throttle_memory_ratio: take_parsed(
                &mut layered,
                "OPTIMIZER_THROTTLE_MEMORY_RATIO",
                default_optimizer_throttle_memory_ratio,
            )?,
            throttle_load_ratio: take_parsed(
                &mut layered,
                "OPTIMIZER_THROTTLE_LOAD_RATIO",
                default_optimizer_throttle_load_ratio,
            )?,
        };

        let runner = RunnerConfig {
            tick_ms: take_parsed(&mut layered, "RUNNER_TICK_MS", default_runner_tick_ms)?,
            concurrency: take_parsed(
                &mut layered,
                "RUNNER_CONCURRENCY",
                default_runner_concurrency,
            )?,
            claim_batch: take_parsed(
                &mut layered,
                "RUNNER_CLAIM_BATCH",
                default_runner_claim_batch,
            )?,
            max_job_attempts: take_parsed(
                &mut layered,
                "RUNNER_MAX_JOB_ATTEMPTS",
                default_runner_max_job_attempts,
            )?,
            job_retry_base_seconds: take_parsed(
                &mut layered,
                "RUNNER_JOB_RETRY_BASE_SECONDS",
                default_runner_job_retry_base_seconds,
            )?,
            job_lease_seconds: take_parsed(
                &mut layered,
                "RUNNER_JOB_LEASE_SECONDS",
                default_runner_job_lease_seconds,
            )?,
        };

        let notify = NotifyConfig {
            operator_webhook_url: take_string(&mut layered, "NOTIFY_OPERATOR_WEBHOOK_URL"),
        };

        let trigger = TriggerConfig {
            full_sync_interval_seconds: take_parsed(
                &mut layered,
                "TRIGGER_FULL_SYNC_INTERVAL_SECONDS",
                || 0,
            )?,
        };

        let config = AppConfig {
            profile,
            api_bind_addr: take_string(&mut layered, "API_BIND_ADDR")
                .unwrap_or_else(default_api_bind_addr),
            log_level: take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level),
            log_format: take_string(&mut layered, "LOG_FORMAT")
                .unwrap_or_else(default_log_format),
            database_url: take_string(&mut layered, "DATABASE_URL")
                .unwrap_or_else(default_database_url),
            db_max_connections: take_parsed(
                &mut layered,
                "DB_MAX_CONNECTIONS",
                default_db_max_connections,
            )?,
            db_acquire_timeout_ms: take_parsed(
                &mut layered,
                "DB_ACQUIRE_TIMEOUT_MS",
                default_db_acquire_timeout_ms,
            )?,
            vendor,
            webhook,
            sync,
            optimizer,
            runner,
            notify,
            trigger,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a key, treating blank values as unset.
fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn take_parsed<T: FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    default: impl FnOnce() -> T,
) -> Result<T, ConfigError> {
    match take_string(layered, key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{key}"),
            value: raw,
        }),
        None => Ok(default()),
    }
}
