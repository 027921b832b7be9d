//! Initial partition sizing for the metric tables
//!
//! Tables that start with a single partition hot-spot every write on one
//! server until the store splits them. This module estimates how many series
//! a cluster will report from its component inventory and pre-computes the
//! partition boundaries for the raw, host aggregate and cluster aggregate
//! tables.
//!
//! ```text
//! inventory ──▶ estimated series ──▶ step(series) ──▶ min(max_regions, heap budget)
//!                                                        │
//!                         raw ◀──────────────────────────┤
//!                         host aggregate = ceil(raw / 4) ┤
//!                         cluster aggregate = ceil(raw / 8)
//! ```
//!
//! Boundaries are evenly spaced over the leading four bytes of the key, so a
//! table split `n` ways gets `n - 1` boundaries. Everything here is pure.

use serde::{Deserialize, Serialize};

use crate::types::{METRIC_KEY_LEN, SERIES_KEY_LEN};

/// Metrics per instance for components we know about
const COMPONENT_WEIGHTS: &[(&str, u64)] = &[
    ("NAMENODE", 1_000),
    ("SECONDARY_NAMENODE", 200),
    ("DATANODE", 250),
    ("JOURNALNODE", 100),
    ("RESOURCEMANAGER", 500),
    ("NODEMANAGER", 300),
    ("HISTORYSERVER", 200),
    ("APP_TIMELINE_SERVER", 200),
    ("HBASE_MASTER", 600),
    ("HBASE_REGIONSERVER", 1_200),
    ("NIMBUS", 300),
    ("SUPERVISOR", 150),
    ("KAFKA_BROKER", 800),
    ("FLUME_HANDLER", 100),
    ("ZOOKEEPER_SERVER", 100),
    ("METRICS_COLLECTOR", 300),
    ("METRICS_MONITOR", 100),
];

/// Weight of a component missing from the table
const DEFAULT_COMPONENT_WEIGHT: u64 = 50;

/// `(series ceiling, partitions)`, ascending
const PARTITION_STEPS: &[(u64, u32)] = &[
    (10_000, 2),
    (50_000, 4),
    (100_000, 8),
    (500_000, 16),
    (1_000_000, 32),
];

/// Partitions above the last step
const MAX_STEP_PARTITIONS: u32 = 64;

/// Share of the heap the store may spend on write buffers, in percent
const MEMSTORE_HEAP_PERCENT: u64 = 40;

/// Errors from split point computation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitPointError {
    /// A storage parameter is zero or otherwise unusable
    #[error("Invalid storage parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name
        name: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Deployed components of a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInventory {
    /// Components running once per cluster
    pub master_components: Vec<String>,
    /// Components running on every slave host
    pub slave_components: Vec<String>,
    /// Number of slave hosts
    pub slave_count: u32,
}

impl ClusterInventory {
    /// Parse comma separated component lists
    pub fn parse(masters: &str, slaves: &str, slave_count: u32) -> Self {
        Self {
            master_components: split_components(masters),
            slave_components: split_components(slaves),
            slave_count,
        }
    }

    /// Estimated number of concurrently active series
    pub fn estimated_series(&self) -> u64 {
        let masters: u64 = self.master_components.iter().map(|c| component_weight(c)).sum();
        let per_slave: u64 = self.slave_components.iter().map(|c| component_weight(c)).sum();
        masters.saturating_add(per_slave.saturating_mul(u64::from(self.slave_count)))
    }
}

fn split_components(list: &str) -> Vec<String> {
    list.split(',')
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
        .collect()
}

fn component_weight(component: &str) -> u64 {
    COMPONENT_WEIGHTS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(component))
        .map_or(DEFAULT_COMPONENT_WEIGHT, |(_, weight)| *weight)
}

/// Memory parameters of the metric store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageParams {
    /// Region server heap, MB
    pub heap_mb: u64,
    /// Write buffer flush size, MB
    pub flush_mb: u64,
    /// Upper bound on raw table partitions
    pub max_regions: u32,
}

impl Default for StorageParams {
    fn default() -> Self {
        Self {
            heap_mb: 1_024,
            flush_mb: 128,
            max_regions: 64,
        }
    }
}

impl StorageParams {
    fn validate(&self) -> Result<(), SplitPointError> {
        let invalid = |name, reason: &str| SplitPointError::InvalidParameter {
            name,
            reason: reason.to_string(),
        };
        if self.heap_mb == 0 {
            return Err(invalid("heap_mb", "must be > 0"));
        }
        if self.flush_mb == 0 {
            return Err(invalid("flush_mb", "must be > 0"));
        }
        if self.max_regions == 0 {
            return Err(invalid("max_regions", "must be > 0"));
        }
        Ok(())
    }

    /// Partitions whose write buffers fit in the memstore share of the heap
    pub fn region_budget(&self) -> u32 {
        let memstore_mb = self.heap_mb.saturating_mul(MEMSTORE_HEAP_PERCENT) / 100;
        let regions = memstore_mb / self.flush_mb.max(1);
        u32::try_from(regions).unwrap_or(u32::MAX).max(1)
    }
}

/// Partition boundaries per table category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPointSet {
    /// Series the sizing was based on
    pub estimated_series: u64,
    /// Boundaries of raw and per-host precision tables (20 byte keys)
    pub host_precision: Vec<Vec<u8>>,
    /// Boundaries of host aggregate tables (20 byte keys)
    pub host_aggregate: Vec<Vec<u8>>,
    /// Boundaries of cluster aggregate tables (16 byte keys)
    pub cluster_aggregate: Vec<Vec<u8>>,
}

impl SplitPointSet {
    /// Partitions of the raw precision tables
    pub fn raw_partitions(&self) -> usize {
        self.host_precision.len() + 1
    }

    /// Partitions of the host aggregate tables
    pub fn host_aggregate_partitions(&self) -> usize {
        self.host_aggregate.len() + 1
    }

    /// Partitions of the cluster aggregate tables
    pub fn cluster_aggregate_partitions(&self) -> usize {
        self.cluster_aggregate.len() + 1
    }
}

/// Lower-case hex of a boundary
pub fn boundary_hex(boundary: &[u8]) -> String {
    boundary.iter().map(|b| format!("{:02x}", b)).collect()
}

fn step_partitions(series: u64) -> u32 {
    PARTITION_STEPS
        .iter()
        .find(|(ceiling, _)| series <= *ceiling)
        .map_or(MAX_STEP_PARTITIONS, |(_, partitions)| *partitions)
}

/// `partitions - 1` evenly spaced keys of `width` bytes
fn boundaries(partitions: u32, width: usize) -> Vec<Vec<u8>> {
    let partitions = u64::from(partitions.max(1));
    (1..partitions)
        .map(|i| {
            let prefix = ((i << 32) / partitions) as u32;
            let mut key = vec![0u8; width];
            key[..4].copy_from_slice(&prefix.to_be_bytes());
            key
        })
        .collect()
}

/// Size and place the initial partitions of every metric table
pub fn compute_split_points(
    inventory: &ClusterInventory,
    params: &StorageParams,
) -> Result<SplitPointSet, SplitPointError> {
    params.validate()?;

    let estimated_series = inventory.estimated_series();
    let raw = step_partitions(estimated_series)
        .min(params.max_regions)
        .min(params.region_budget())
        .max(1);
    let host_aggregate = raw.div_ceil(4).max(1);
    let cluster_aggregate = raw.div_ceil(8).max(1);

    tracing::debug!(
        estimated_series,
        raw,
        host_aggregate,
        cluster_aggregate,
        "Computed split points"
    );

    Ok(SplitPointSet {
        estimated_series,
        host_precision: boundaries(raw, SERIES_KEY_LEN),
        host_aggregate: boundaries(host_aggregate, SERIES_KEY_LEN),
        cluster_aggregate: boundaries(cluster_aggregate, METRIC_KEY_LEN),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn large_params() -> StorageParams {
        StorageParams {
            heap_mb: 32_768,
            flush_mb: 128,
            max_regions: 64,
        }
    }

    #[test]
    fn test_inventory_parse_and_estimate() {
        let inv = ClusterInventory::parse("NAMENODE, resourcemanager", "DATANODE,NODEMANAGER,,", 10);
        assert_eq!(inv.master_components, vec!["NAMENODE", "RESOURCEMANAGER"]);
        assert_eq!(inv.slave_components.len(), 2);
        assert_eq!(inv.estimated_series(), 1_000 + 500 + (250 + 300) * 10);

        let unknown = ClusterInventory::parse("CUSTOM_MASTER", "", 0);
        assert_eq!(unknown.estimated_series(), DEFAULT_COMPONENT_WEIGHT);
    }

    #[test]
    fn test_small_cluster() {
        let inv = ClusterInventory::parse("NAMENODE", "DATANODE", 3);
        let set = compute_split_points(&inv, &large_params()).unwrap();
        assert_eq!(set.raw_partitions(), 2);
        assert_eq!(set.host_aggregate_partitions(), 1);
        assert_eq!(set.cluster_aggregate_partitions(), 1);
        assert!(set.host_aggregate.is_empty());
    }

    #[test]
    fn test_more_series_more_partitions() {
        let small = ClusterInventory::parse("NAMENODE", "DATANODE,NODEMANAGER", 20);
        let large = ClusterInventory::parse(
            "NAMENODE,HBASE_MASTER",
            "DATANODE,NODEMANAGER,HBASE_REGIONSERVER",
            400,
        );
        let a = compute_split_points(&small, &large_params()).unwrap();
        let b = compute_split_points(&large, &large_params()).unwrap();
        assert!(b.raw_partitions() > a.raw_partitions());
        assert!(b.cluster_aggregate_partitions() < b.raw_partitions());
        assert_eq!(b.host_aggregate_partitions(), b.raw_partitions().div_ceil(4));
        assert_eq!(b.cluster_aggregate_partitions(), b.raw_partitions().div_ceil(8));
    }

    #[test]
    fn test_caps() {
        let huge = ClusterInventory::parse("NAMENODE", "DATANODE,HBASE_REGIONSERVER", 5_000);

        let capped = StorageParams {
            max_regions: 10,
            ..large_params()
        };
        assert_eq!(compute_split_points(&huge, &capped).unwrap().raw_partitions(), 10);

        // 1 GB heap with 128 MB flushes buffers 3 regions
        let small_heap = StorageParams::default();
        assert_eq!(small_heap.region_budget(), 3);
        assert_eq!(compute_split_points(&huge, &small_heap).unwrap().raw_partitions(), 3);
    }

    #[test]
    fn test_boundaries_sorted_and_deterministic() {
        let inv = ClusterInventory::parse("NAMENODE", "DATANODE,NODEMANAGER", 200);
        let a = compute_split_points(&inv, &large_params()).unwrap();
        let b = compute_split_points(&inv, &large_params()).unwrap();
        assert_eq!(a, b);

        assert!(a.host_precision.windows(2).all(|w| w[0] < w[1]));
        assert!(a.host_precision.iter().all(|k| k.len() == SERIES_KEY_LEN));
        assert!(a.cluster_aggregate.iter().all(|k| k.len() == METRIC_KEY_LEN));

        let halves = boundaries(2, 4);
        assert_eq!(boundary_hex(&halves[0]), "80000000");
    }

    #[test]
    fn test_invalid_params() {
        let inv = ClusterInventory::parse("NAMENODE", "", 0);
        let err = compute_split_points(
            &inv,
            &StorageParams {
                flush_mb: 0,
                ..StorageParams::default()
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SplitPointError::InvalidParameter { name: "flush_mb", .. }
        ));
    }
}
