//! pgspans-core — shared library for the pgspans collector.
//!
//! Provides:
//! - `collector` — database sessions, backend handlers, capability detection
//! - `parser` — raw log/plan rows into normalized spans
//! - `state` — per-target cursor and dedup window
//! - `export` — byte-bounded batching and delivery to the ingestion endpoint
//! - `scheduler` — per-target lifecycle and periodic cycles
//! - `config` — environment-sourced settings

pub mod collector;
pub mod config;
pub mod error;
pub mod export;
pub mod model;
pub mod parser;
pub mod scheduler;
pub mod state;

pub use config::CollectorConfig;
pub use model::{SpanRecord, Target};
pub use scheduler::{Scheduler, SchedulerHandle, TargetStatus};

/// Crate version with the short git SHA embedded at build time.
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_SHA"), ")");
