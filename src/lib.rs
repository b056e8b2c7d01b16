//! # printsync
//!
//! Synchronizes products and orders between a storefront and the Printify
//! print-on-demand API: chunked deferred imports, per-entity tracking with
//! retries, adaptive batch sizing and signed webhook ingestion.

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod job_runner;
pub mod models;
pub mod notify;
pub mod optimizer;
pub mod pipeline;
pub mod repositories;
pub mod scheduler;
pub mod server;
pub mod telemetry;
pub mod trigger;
pub mod vendor;
pub mod webhooks;
pub mod worker;
pub use migration;
