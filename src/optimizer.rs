//! # Import Optimizer
//!
//! Chooses the chunk size for new import runs from recent outcomes and host
//! load, and tells the pipeline when to back off entirely.

use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::gauge;
use tracing::{debug, instrument, warn};

use crate::config::{OptimizerConfig, SyncConfig};
use crate::error::SyncError;
use crate::repositories::{OutcomeCounts, SyncBatchRepository, SyncTrackingRepository};

/// A point-in-time view of host pressure, both as fractions of capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadSample {
    /// 1-minute load average divided by the CPU count
    pub load_ratio: f64,
    /// Resident memory divided by the configured limit
    pub memory_ratio: f64,
}

/// Source of load samples.
pub trait LoadSampler: Send + Sync {
    fn sample(&self) -> LoadSample;
}

/// Reads `/proc` on Linux. Reports zero pressure where `/proc` is unavailable.
#[derive(Debug, Clone)]
pub struct SystemLoadSampler {
    memory_limit_bytes: u64,
}

const PAGE_SIZE: u64 = 4096;

impl SystemLoadSampler {
    pub fn new(memory_limit_mb: u64) -> Self {
        Self {
            memory_limit_bytes: memory_limit_mb.saturating_mul(1024 * 1024),
        }
    }

    fn load_ratio() -> f64 {
        let Ok(loadavg) = std::fs::read_to_string("/proc/loadavg") else {
            return 0.0;
        };
        let one_minute = loadavg
            .split_whitespace()
            .next()
            .and_then(|value| value.parse::<f64>().ok())
            .unwrap_or(0.0);
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        one_minute / cpus
    }

    fn memory_ratio(&self) -> f64 {
        if self.memory_limit_bytes == 0 {
            return 0.0;
        }
        let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
            return 0.0;
        };
        let resident_pages = statm
            .split_whitespace()
            .nth(1)
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        (resident_pages * PAGE_SIZE) as f64 / self.memory_limit_bytes as f64
    }
}

impl LoadSampler for SystemLoadSampler {
    fn sample(&self) -> LoadSample {
        LoadSample {
            load_ratio: Self::load_ratio(),
            memory_ratio: self.memory_ratio(),
        }
    }
}

/// Always returns the same sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticLoadSampler(pub LoadSample);

impl LoadSampler for StaticLoadSampler {
    fn sample(&self) -> LoadSample {
        self.0
    }
}

/// Next chunk size given the current one, recent outcomes and load.
///
/// Grows when nearly everything succeeds on an idle host, shrinks when
/// errors pile up or the host is busy, otherwise holds. The result is always
/// clamped to `[min_chunk, max_chunk]`.
pub fn next_chunk_size(
    current: usize,
    outcomes: OutcomeCounts,
    load: LoadSample,
    optimizer: &OptimizerConfig,
    sync: &SyncConfig,
) -> usize {
    let current = current.clamp(sync.min_chunk, sync.max_chunk);
    let total = outcomes.total();
    if total == 0 {
        return current;
    }

    let success_rate = outcomes.completed as f64 / total as f64;
    let error_rate = outcomes.errored as f64 / total as f64;

    let next = if success_rate > optimizer.grow_success_rate
        && load.load_ratio < optimizer.grow_max_load
    {
        (current as f64 * optimizer.grow_factor).floor() as usize
    } else if error_rate > optimizer.shrink_error_rate || load.load_ratio > optimizer.shrink_min_load
    {
        (current as f64 * optimizer.shrink_factor).floor() as usize
    } else {
        current
    };

    next.clamp(sync.min_chunk, sync.max_chunk)
}

pub struct ImportOptimizer {
    batches: SyncBatchRepository,
    tracking: SyncTrackingRepository,
    sampler: Arc<dyn LoadSampler>,
    optimizer: OptimizerConfig,
    sync: SyncConfig,
}

impl ImportOptimizer {
    pub fn new(
        batches: SyncBatchRepository,
        tracking: SyncTrackingRepository,
        sampler: Arc<dyn LoadSampler>,
        optimizer: OptimizerConfig,
        sync: SyncConfig,
    ) -> Self {
        Self {
            batches,
            tracking,
            sampler,
            optimizer,
            sync,
        }
    }

    /// Chunk size to use now, scoped to a run's history when `run_id` is given.
    #[instrument(skip(self))]
    pub async fn optimize_batch_size(&self, run_id: Option<&str>) -> Result<usize, SyncError> {
        let current = self
            .batches
            .latest_import_chunk_size(run_id)
            .await?
            .unwrap_or(self.sync.default_chunk);

        let since = (Utc::now() - Duration::seconds(self.optimizer.metrics_window_seconds))
            .fixed_offset();
        let outcomes = self.tracking.outcome_counts(run_id, since).await?;
        let load = self.sampler.sample();

        let size = next_chunk_size(current, outcomes, load, &self.optimizer, &self.sync);

        if size != current {
            debug!(
                previous = current,
                next = size,
                completed = outcomes.completed,
                errored = outcomes.errored,
                load_ratio = load.load_ratio,
                "Adjusted import chunk size"
            );
        }
        gauge!("optimizer_chunk_size").set(size as f64);

        Ok(size)
    }

    /// True when the host is too loaded to start more work.
    pub fn should_throttle(&self) -> bool {
        let load = self.sampler.sample();
        let throttle = load.memory_ratio > self.optimizer.throttle_memory_ratio
            || load.load_ratio > self.optimizer.throttle_load_ratio;
        if throttle {
            warn!(
                load_ratio = load.load_ratio,
                memory_ratio = load.memory_ratio,
                "Host under pressure, throttling sync work"
            );
        }
        throttle
    }
}
