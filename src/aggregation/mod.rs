//! Rollup Aggregation
//!
//! The work performed by each rollup level once its scheduler has picked a
//! window. Every level reads finer rows, merges them into coarser summaries
//! and writes them back with overwrite semantics:
//!
//! ```text
//!  raw points ──▶ host minute ──▶ host hourly ──▶ host daily
//!      │
//!      └──────▶ cluster second (30s slices, across hosts)
//!                     │
//!                     └──▶ cluster minute ──▶ cluster hourly ──▶ cluster daily
//! ```
//!
//! # Components
//!
//! - [`math`]: the pure merge functions for host and cluster summaries
//! - [`host`]: per-series time rollups ([`HostRollup`])
//! - [`cluster`]: cross-host slicing ([`ClusterSecondAggregator`]) and the
//!   coarser cluster time rollups ([`ClusterTimeRollup`])
//!
//! All outputs are ordered maps, so running a level twice over the same input
//! writes bit-identical rows.

pub mod cluster;
pub mod host;
pub mod math;

pub use cluster::{ClusterAggregatorConfig, ClusterSecondAggregator, ClusterTimeRollup};
pub use host::{HostRollup, HostSource};
pub use math::{merge_cluster, merge_host, ClusterAggregate, HostAggregate};

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::AggregationError;
use crate::types::{TimeRange, Timestamp};

/// Group count above which merging is spread across the rayon pool
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 4_096;

// ============================================================================
// Rollup Work
// ============================================================================

/// Result of one successful aggregation step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkSummary {
    /// Input rows or points read
    pub rows_read: usize,
    /// Output rows written
    pub rows_written: usize,
}

/// The aggregation step of one rollup level
///
/// Implementations must be restartable: running the same window twice
/// produces the same rows, and a failed call leaves no partial state that a
/// re-run would not overwrite.
#[async_trait]
pub trait RollupWork: Send + Sync {
    /// Aggregate the rows of `window` into the level's output table
    async fn do_work(&self, window: TimeRange) -> Result<WorkSummary, AggregationError>;
}

/// Start of the bucket of width `bucket_ms` containing `ts`
#[inline]
pub fn bucket_start(ts: Timestamp, bucket_ms: i64) -> Timestamp {
    ts.div_euclid(bucket_ms) * bucket_ms
}

/// Widen `window` back to a bucket boundary
///
/// A bucket cut in two by consecutive windows is recomputed whole by the
/// later window, and the overwrite replaces the partial row.
pub fn aligned_read_range(window: TimeRange, bucket_ms: i64) -> TimeRange {
    TimeRange {
        start: bucket_start(window.start, bucket_ms),
        end: window.end,
    }
}

// ============================================================================
// Aggregator Statistics
// ============================================================================

/// Counters kept by every aggregation step
#[derive(Debug, Default)]
pub struct AggregatorStats {
    /// Windows processed
    pub windows: AtomicU64,

    /// Input rows consumed
    pub rows_read: AtomicU64,

    /// Output rows written
    pub rows_written: AtomicU64,

    /// Windows that produced no rows
    pub empty_windows: AtomicU64,

    /// Points skipped because their series key is unknown
    pub unresolved_points: AtomicU64,
}

impl AggregatorStats {
    /// Record a finished window
    pub fn record(&self, summary: &WorkSummary) {
        self.windows.fetch_add(1, Ordering::Relaxed);
        self.rows_read
            .fetch_add(summary.rows_read as u64, Ordering::Relaxed);
        self.rows_written
            .fetch_add(summary.rows_written as u64, Ordering::Relaxed);
        if summary.rows_written == 0 {
            self.empty_windows.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get a snapshot of current statistics
    pub fn snapshot(&self) -> AggregatorStatsSnapshot {
        AggregatorStatsSnapshot {
            windows: self.windows.load(Ordering::Relaxed),
            rows_read: self.rows_read.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            empty_windows: self.empty_windows.load(Ordering::Relaxed),
            unresolved_points: self.unresolved_points.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of aggregator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorStatsSnapshot {
    /// Windows processed
    pub windows: u64,
    /// Input rows consumed
    pub rows_read: u64,
    /// Output rows written
    pub rows_written: u64,
    /// Windows that produced no rows
    pub empty_windows: u64,
    /// Points skipped because their series key is unknown
    pub unresolved_points: u64,
}
