//! Kuba Rollup - multi-precision rollups for cluster telemetry
//!
//! This library turns raw per-host metric points into coarser summaries and
//! decides at query time which summary table to read:
//! - Host rollups: raw → minute → hourly → daily, per series
//! - Cluster rollups: 30 second cross-host slices, then minute/hourly/daily
//! - Checkpointed per-level schedulers with catch-up and lag skipping
//! - A precision planner that keeps query results under a row limit
//! - Partition sizing for the metric tables from the cluster inventory

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod storage;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Aggregate math and the per-level aggregation steps
pub mod aggregation;

/// Series identity cache: tuple to compact key assignment and resolution
pub mod metadata;

/// Query precision planning and condition building
pub mod query;

/// Background services: per-level rollup schedulers and checkpoints
pub mod services;

// Re-export main types
pub use config::Config;
pub use error::{Error, Result};
pub use types::{Precision, TimeRange, Timestamp};
