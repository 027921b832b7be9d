//! Storage collaborator interfaces
//!
//! The rollup engine never talks to a column store directly. It reads and
//! writes through the traits below, which a deployment implements on top of
//! whatever engine holds the metric tables.
//!
//! ```text
//! ┌──────────────────┐    read_points     ┌──────────────────────┐
//! │ RawPointReader   │───────────────────▶│                      │
//! └──────────────────┘                    │   Rollup levels      │
//! ┌──────────────────┐  read_*_aggregates │ (host + cluster)     │
//! │ AggregateReader  │───────────────────▶│                      │
//! └──────────────────┘                    └──────────┬───────────┘
//!                                                    │ write_*_aggregates
//!                                                    ▼
//!                                         ┌──────────────────────┐
//!                                         │   AggregateWriter    │
//!                                         └──────────────────────┘
//! ```
//!
//! Writers must have overwrite semantics: writing the same rows twice leaves
//! the table as if they were written once. Schedulers rely on this when a
//! window is re-run after a failed cycle.

pub mod memory;
pub mod split_points;

pub use memory::InMemoryStore;
pub use split_points::{
    compute_split_points, ClusterInventory, SplitPointError, SplitPointSet, StorageParams,
};

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::aggregation::math::{ClusterAggregate, HostAggregate};
use crate::error::StorageError;
use crate::types::{MetricIdentity, Precision, RawPoint, SeriesKey, TimeRange, Timestamp};

// =============================================================================
// Row Types
// =============================================================================

/// One row of a host aggregate table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostAggregateRow {
    /// Series the row belongs to
    pub key: SeriesKey,
    /// Start of the row's window
    pub timestamp: Timestamp,
    /// Summary over the window
    pub aggregate: HostAggregate,
}

/// Identity of a cluster row: metric plus window timestamp
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterMetric {
    /// Metric identity (no host)
    pub identity: MetricIdentity,
    /// Start of the row's window
    pub timestamp: Timestamp,
}

impl ClusterMetric {
    /// Create a cluster row identity
    pub fn new(identity: MetricIdentity, timestamp: Timestamp) -> Self {
        Self {
            identity,
            timestamp,
        }
    }
}

/// One row of the finest cluster table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAggregateRow {
    /// Row identity
    pub metric: ClusterMetric,
    /// Cross-host summary
    pub aggregate: ClusterAggregate,
}

/// One row of a coarser cluster table (time rollup of cluster rows)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTimeRow {
    /// Row identity
    pub metric: ClusterMetric,
    /// Summary of cluster sums over the window
    pub aggregate: HostAggregate,
}

/// Host rows keyed by (series, window start)
pub type HostAggregateMap = BTreeMap<(SeriesKey, Timestamp), HostAggregate>;

/// Finest cluster rows
pub type ClusterAggregateMap = BTreeMap<ClusterMetric, ClusterAggregate>;

/// Coarser cluster rows
pub type ClusterTimeMap = BTreeMap<ClusterMetric, HostAggregate>;

// =============================================================================
// Reader / Writer Traits
// =============================================================================

/// Reads raw points written by ingestion
#[async_trait]
pub trait RawPointReader: Send + Sync {
    /// Read the points of `series` inside `range`
    ///
    /// An empty `series` slice selects every series. Points are returned in
    /// ascending timestamp order within each series. Calls are restartable:
    /// reading the same range again yields the same points.
    async fn read_points(
        &self,
        series: &[SeriesKey],
        range: TimeRange,
    ) -> Result<Vec<RawPoint>, StorageError>;
}

/// Reads previously written aggregate rows
#[async_trait]
pub trait AggregateReader: Send + Sync {
    /// Host rows of `precision` whose window start falls in `range`
    async fn read_host_aggregates(
        &self,
        precision: Precision,
        range: TimeRange,
    ) -> Result<Vec<HostAggregateRow>, StorageError>;

    /// Finest cluster rows whose timestamp falls in `range`
    async fn read_cluster_aggregates(
        &self,
        range: TimeRange,
    ) -> Result<Vec<ClusterAggregateRow>, StorageError>;

    /// Coarser cluster rows of `precision` whose timestamp falls in `range`
    async fn read_cluster_time_aggregates(
        &self,
        precision: Precision,
        range: TimeRange,
    ) -> Result<Vec<ClusterTimeRow>, StorageError>;
}

/// Persists aggregate rows with overwrite semantics
#[async_trait]
pub trait AggregateWriter: Send + Sync {
    /// Upsert host rows into the `precision` host table, returning rows written
    async fn write_host_aggregates(
        &self,
        precision: Precision,
        rows: &HostAggregateMap,
    ) -> Result<usize, StorageError>;

    /// Upsert rows into the finest cluster table
    async fn write_cluster_aggregates(
        &self,
        rows: &ClusterAggregateMap,
    ) -> Result<usize, StorageError>;

    /// Upsert rows into the `precision` cluster table
    async fn write_cluster_time_aggregates(
        &self,
        precision: Precision,
        rows: &ClusterTimeMap,
    ) -> Result<usize, StorageError>;
}
