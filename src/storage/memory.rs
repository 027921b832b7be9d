//! In-memory implementation of every storage collaborator
//!
//! Backs the tests and the daemon's standalone mode. Tables are ordered maps
//! so scans come back in key order, and every write is an upsert.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    AggregateReader, AggregateWriter, ClusterAggregateMap, ClusterAggregateRow, ClusterTimeMap,
    ClusterTimeRow, HostAggregateMap, HostAggregateRow, RawPointReader,
};
use crate::aggregation::math::{ClusterAggregate, HostAggregate};
use crate::error::StorageError;
use crate::storage::ClusterMetric;
use crate::types::{Precision, RawPoint, SeriesKey, TimeRange, Timestamp};

/// Per-table row counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryStoreStats {
    /// Raw points held
    pub raw_points: usize,
    /// Host rows per precision
    pub host_rows: HashMap<Precision, usize>,
    /// Finest cluster rows
    pub cluster_rows: usize,
    /// Coarser cluster rows per precision
    pub cluster_time_rows: HashMap<Precision, usize>,
}

/// Thread-safe in-memory metric tables
#[derive(Debug, Default)]
pub struct InMemoryStore {
    raw: RwLock<BTreeMap<(SeriesKey, Timestamp), f64>>,
    host: RwLock<HashMap<Precision, HostAggregateMap>>,
    cluster: RwLock<ClusterAggregateMap>,
    cluster_time: RwLock<HashMap<Precision, ClusterTimeMap>>,

    /// Number of upcoming writes that should fail (failure injection)
    failing_writes: AtomicUsize,

    /// Number of upcoming reads that should fail (failure injection)
    failing_reads: AtomicUsize,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert raw points, replacing any point at the same (series, timestamp)
    pub fn insert_points(&self, points: &[RawPoint]) {
        let mut raw = self.raw.write();
        for p in points {
            raw.insert((p.key, p.timestamp), p.value);
        }
    }

    /// Make the next `n` write calls fail with a connection error
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` read calls fail with a timeout error
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Snapshot of one host table
    pub fn host_rows(&self, precision: Precision) -> HostAggregateMap {
        self.host.read().get(&precision).cloned().unwrap_or_default()
    }

    /// Snapshot of the finest cluster table
    pub fn cluster_rows(&self) -> ClusterAggregateMap {
        self.cluster.read().clone()
    }

    /// Snapshot of a coarser cluster table
    pub fn cluster_time_rows(&self, precision: Precision) -> ClusterTimeMap {
        self.cluster_time
            .read()
            .get(&precision)
            .cloned()
            .unwrap_or_default()
    }

    /// Row counts for every table
    pub fn stats(&self) -> InMemoryStoreStats {
        InMemoryStoreStats {
            raw_points: self.raw.read().len(),
            host_rows: self
                .host
                .read()
                .iter()
                .map(|(p, rows)| (*p, rows.len()))
                .collect(),
            cluster_rows: self.cluster.read().len(),
            cluster_time_rows: self
                .cluster_time
                .read()
                .iter()
                .map(|(p, rows)| (*p, rows.len()))
                .collect(),
        }
    }

    /// Drop raw points older than `cutoff`, returning how many were removed
    pub fn evict_raw_before(&self, cutoff: Timestamp) -> usize {
        let mut raw = self.raw.write();
        let before = raw.len();
        raw.retain(|(_, ts), _| *ts >= cutoff);
        before - raw.len()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_write(&self) -> Result<(), StorageError> {
        if Self::take_failure(&self.failing_writes) {
            return Err(StorageError::Connection(
                "injected write failure".to_string(),
            ));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<(), StorageError> {
        if Self::take_failure(&self.failing_reads) {
            return Err(StorageError::Timeout("injected read failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RawPointReader for InMemoryStore {
    async fn read_points(
        &self,
        series: &[SeriesKey],
        range: TimeRange,
    ) -> Result<Vec<RawPoint>, StorageError> {
        self.check_read()?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let raw = self.raw.read();

        let points = if series.is_empty() {
            raw.iter()
                .filter(|((_, ts), _)| range.contains(*ts))
                .map(|((key, ts), value)| RawPoint::new(*key, *ts, *value))
                .collect()
        } else {
            let mut keys = series.to_vec();
            keys.sort();
            keys.dedup();
            keys.iter()
                .flat_map(|key| {
                    raw.range((*key, range.start)..(*key, range.end))
                        .map(|((key, ts), value)| RawPoint::new(*key, *ts, *value))
                })
                .collect()
        };

        Ok(points)
    }
}

#[async_trait]
impl AggregateReader for InMemoryStore {
    async fn read_host_aggregates(
        &self,
        precision: Precision,
        range: TimeRange,
    ) -> Result<Vec<HostAggregateRow>, StorageError> {
        self.check_read()?;
        let host = self.host.read();
        Ok(host
            .get(&precision)
            .map(|rows| {
                rows.iter()
                    .filter(|((_, ts), _)| range.contains(*ts))
                    .map(|((key, ts), aggregate)| HostAggregateRow {
                        key: *key,
                        timestamp: *ts,
                        aggregate: *aggregate,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_cluster_aggregates(
        &self,
        range: TimeRange,
    ) -> Result<Vec<ClusterAggregateRow>, StorageError> {
        self.check_read()?;
        Ok(self
            .cluster
            .read()
            .iter()
            .filter(|(metric, _)| range.contains(metric.timestamp))
            .map(|(metric, aggregate): (&ClusterMetric, &ClusterAggregate)| {
                ClusterAggregateRow {
                    metric: metric.clone(),
                    aggregate: *aggregate,
                }
            })
            .collect())
    }

    async fn read_cluster_time_aggregates(
        &self,
        precision: Precision,
        range: TimeRange,
    ) -> Result<Vec<ClusterTimeRow>, StorageError> {
        self.check_read()?;
        let tables = self.cluster_time.read();
        Ok(tables
            .get(&precision)
            .map(|rows| {
                rows.iter()
                    .filter(|(metric, _)| range.contains(metric.timestamp))
                    .map(|(metric, aggregate): (&ClusterMetric, &HostAggregate)| {
                        ClusterTimeRow {
                            metric: metric.clone(),
                            aggregate: *aggregate,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl AggregateWriter for InMemoryStore {
    async fn write_host_aggregates(
        &self,
        precision: Precision,
        rows: &HostAggregateMap,
    ) -> Result<usize, StorageError> {
        self.check_write()?;
        let mut host = self.host.write();
        let table = host.entry(precision).or_default();
        for (key, aggregate) in rows {
            table.insert(*key, *aggregate);
        }
        Ok(rows.len())
    }

    async fn write_cluster_aggregates(
        &self,
        rows: &ClusterAggregateMap,
    ) -> Result<usize, StorageError> {
        self.check_write()?;
        let mut cluster = self.cluster.write();
        for (metric, aggregate) in rows {
            cluster.insert(metric.clone(), *aggregate);
        }
        Ok(rows.len())
    }

    async fn write_cluster_time_aggregates(
        &self,
        precision: Precision,
        rows: &ClusterTimeMap,
    ) -> Result<usize, StorageError> {
        self.check_write()?;
        let mut tables = self.cluster_time.write();
        let table = tables.entry(precision).or_default();
        for (metric, aggregate) in rows {
            table.insert(metric.clone(), *aggregate);
        }
        Ok(rows.len())
    }
}
