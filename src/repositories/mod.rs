//! # Repository Layer
//!
//! Repositories wrap SeaORM access to the sync tables. Every status change
//! is a conditional UPDATE so concurrent workers cannot move a row backwards,
//! and every database failure surfaces as a critical [`crate::error::SyncError`].

pub mod scheduled_job;
pub mod sync_batch;
pub mod sync_run;
pub mod sync_tracking;

pub use scheduled_job::ScheduledJobRepository;
pub use sync_batch::SyncBatchRepository;
pub use sync_run::{RunSummary, SyncRunRepository};
pub use sync_tracking::{EntityKey, FailureOutcome, OutcomeCounts, SyncTrackingRepository};
