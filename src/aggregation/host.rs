//! Host Rollups
//!
//! Per-series time rollups: raw points into minute rows, minute rows into
//! hourly rows, hourly rows into daily rows. Rows are grouped by
//! `(series key, bucket start)` and merged with [`merge_host`]; a raw point is
//! a single-sample aggregate.
//!
//! [`merge_host`]: super::math::merge_host

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rayon::prelude::*;

use super::math::{fold_host, HostAggregate};
use super::{
    aligned_read_range, bucket_start, AggregatorStats, AggregatorStatsSnapshot, RollupWork,
    WorkSummary, DEFAULT_PARALLEL_THRESHOLD,
};
use crate::error::AggregationError;
use crate::storage::{
    AggregateReader, AggregateWriter, HostAggregateMap, HostAggregateRow, RawPointReader,
};
use crate::types::{Precision, RawPoint, SeriesKey, TimeRange, Timestamp};

/// Where a host rollup reads its input
#[derive(Clone)]
pub enum HostSource {
    /// Raw points written by ingestion
    Raw(Arc<dyn RawPointReader>),
    /// Host rows of a finer precision
    Aggregates {
        /// Reader of the finer table
        reader: Arc<dyn AggregateReader>,
        /// Precision of the finer table
        precision: Precision,
    },
}

impl std::fmt::Debug for HostSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostSource::Raw(_) => f.write_str("Raw"),
            HostSource::Aggregates { precision, .. } => write!(f, "Aggregates({})", precision),
        }
    }
}

/// Rollup of host rows into one coarser host table
pub struct HostRollup {
    source: HostSource,
    writer: Arc<dyn AggregateWriter>,
    target: Precision,
    parallel_threshold: usize,
    stats: AggregatorStats,
}

impl HostRollup {
    /// Create a rollup writing `target` rows
    pub fn new(source: HostSource, writer: Arc<dyn AggregateWriter>, target: Precision) -> Self {
        Self {
            source,
            writer,
            target,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
            stats: AggregatorStats::default(),
        }
    }

    /// Minute rollup over raw points
    pub fn minute(reader: Arc<dyn RawPointReader>, writer: Arc<dyn AggregateWriter>) -> Self {
        Self::new(HostSource::Raw(reader), writer, Precision::Minutes)
    }

    /// Rollup of `target`'s next finer host table into `target`
    pub fn from_finer(
        reader: Arc<dyn AggregateReader>,
        writer: Arc<dyn AggregateWriter>,
        target: Precision,
    ) -> Result<Self, AggregationError> {
        let precision = match target.finer() {
            Some(p) if p != Precision::Seconds => p,
            _ => {
                return Err(AggregationError::InvalidWindow {
                    start: 0,
                    end: 0,
                    reason: format!("{} host rows are not built from aggregates", target),
                })
            },
        };
        Ok(Self::new(
            HostSource::Aggregates { reader, precision },
            writer,
            target,
        ))
    }

    /// Group count above which merging runs on the rayon pool
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    /// Output precision
    pub fn target(&self) -> Precision {
        self.target
    }

    /// Get statistics
    pub fn stats(&self) -> AggregatorStatsSnapshot {
        self.stats.snapshot()
    }
}

#[async_trait]
impl RollupWork for HostRollup {
    async fn do_work(&self, window: TimeRange) -> Result<WorkSummary, AggregationError> {
        let bucket = self.target.bucket_millis();
        let range = aligned_read_range(window, bucket);

        let (rows, rows_read) = match &self.source {
            HostSource::Raw(reader) => {
                let points = reader.read_points(&[], range).await?;
                let n = points.len();
                (
                    rollup_points(&points, bucket, self.parallel_threshold),
                    n,
                )
            },
            HostSource::Aggregates { reader, precision } => {
                let input = reader.read_host_aggregates(*precision, range).await?;
                let n = input.len();
                (rollup_rows(&input, bucket, self.parallel_threshold), n)
            },
        };

        let rows_written = if rows.is_empty() {
            0
        } else {
            self.writer.write_host_aggregates(self.target, &rows).await?
        };

        tracing::debug!(
            target_precision = %self.target,
            window = %window,
            rows_read,
            rows_written,
            "Host rollup finished"
        );

        let summary = WorkSummary {
            rows_read,
            rows_written,
        };
        self.stats.record(&summary);
        Ok(summary)
    }
}

// ============================================================================
// Pure rollup functions
// ============================================================================

/// Roll raw points into `bucket_ms` host rows
pub fn rollup_points(points: &[RawPoint], bucket_ms: i64, parallel_threshold: usize) -> HostAggregateMap {
    let mut groups: BTreeMap<(SeriesKey, Timestamp), Vec<f64>> = BTreeMap::new();
    for p in points {
        groups
            .entry((p.key, bucket_start(p.timestamp, bucket_ms)))
            .or_default()
            .push(p.value);
    }

    if groups.len() > parallel_threshold {
        groups
            .into_par_iter()
            .map(|(k, values)| (k, HostAggregate::from_values(&values)))
            .collect::<Vec<_>>()
            .into_iter()
            .collect()
    } else {
        groups
            .into_iter()
            .map(|(k, values)| (k, HostAggregate::from_values(&values)))
            .collect()
    }
}

/// Roll finer host rows into `bucket_ms` host rows
pub fn rollup_rows(
    rows: &[HostAggregateRow],
    bucket_ms: i64,
    parallel_threshold: usize,
) -> HostAggregateMap {
    let mut groups: BTreeMap<(SeriesKey, Timestamp), Vec<HostAggregate>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((row.key, bucket_start(row.timestamp, bucket_ms)))
            .or_default()
            .push(row.aggregate);
    }

    if groups.len() > parallel_threshold {
        groups
            .into_par_iter()
            .map(|(k, aggs)| (k, fold_host(&aggs)))
            .collect::<Vec<_>>()
            .into_iter()
            .collect()
    } else {
        groups
            .into_iter()
            .map(|(k, aggs)| (k, fold_host(&aggs)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::types::{HostKey, MetricKey};

    fn key(m: u8) -> SeriesKey {
        SeriesKey::new(MetricKey([m; 16]), HostKey([1; 4]))
    }

    #[test]
    fn test_rollup_points_buckets() {
        let points = vec![
            RawPoint::new(key(1), 0, 1.0),
            RawPoint::new(key(1), 10_000, 3.0),
            RawPoint::new(key(1), 60_000, 10.0),
            RawPoint::new(key(2), 5_000, 7.0),
        ];
        let rows = rollup_points(&points, 60_000, DEFAULT_PARALLEL_THRESHOLD);

        assert_eq!(rows.len(), 3);
        let first = rows[&(key(1), 0)];
        assert_eq!(first.count, 2);
        assert_eq!(first.sum, 4.0);
        assert_eq!(first.min, 1.0);
        assert_eq!(first.max, 3.0);
        assert_eq!(rows[&(key(1), 60_000)].count, 1);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let points: Vec<RawPoint> = (0..500)
            .map(|i| RawPoint::new(key((i % 7) as u8), (i as i64) * 7_000, i as f64))
            .collect();
        let seq = rollup_points(&points, 60_000, usize::MAX);
        let par = rollup_points(&points, 60_000, 0);
        assert_eq!(seq, par);
    }

    #[test]
    fn test_rollup_rows_merges() {
        let rows = vec![
            HostAggregateRow {
                key: key(1),
                timestamp: 0,
                aggregate: HostAggregate::from_values(&[1.0, 2.0]),
            },
            HostAggregateRow {
                key: key(1),
                timestamp: 60_000,
                aggregate: HostAggregate::from_values(&[3.0, 4.0]),
            },
        ];
        let out = rollup_rows(&rows, 3_600_000, DEFAULT_PARALLEL_THRESHOLD);
        assert_eq!(out.len(), 1);
        let agg = out[&(key(1), 0)];
        assert_eq!(agg.count, 4);
        assert_eq!(agg.sum, 10.0);
    }

    #[tokio::test]
    async fn test_minute_rollup_writes_rows() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_points(&[
            RawPoint::new(key(1), 1_000, 2.0),
            RawPoint::new(key(1), 2_000, 4.0),
            RawPoint::new(key(1), 300_000, 9.0),
        ]);

        let rollup = HostRollup::minute(store.clone(), store.clone());
        let summary = rollup
            .do_work(TimeRange::new(0, 300_000).unwrap())
            .await
            .unwrap();

        assert_eq!(summary.rows_read, 2);
        assert_eq!(summary.rows_written, 1);
        let rows = store.host_rows(Precision::Minutes);
        assert_eq!(rows[&(key(1), 0)].average(), 3.0);
        assert_eq!(rollup.stats().windows, 1);
    }

    #[tokio::test]
    async fn test_split_bucket_is_recomputed_whole() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_points(&[
            RawPoint::new(key(1), 10_000, 1.0),
            RawPoint::new(key(1), 50_000, 3.0),
        ]);
        let rollup = HostRollup::minute(store.clone(), store.clone());

        // The minute bucket [0, 60s) is cut at 30s by the window boundary
        rollup
            .do_work(TimeRange::new(0, 30_000).unwrap())
            .await
            .unwrap();
        rollup
            .do_work(TimeRange::new(30_000, 60_000).unwrap())
            .await
            .unwrap();

        let row = store.host_rows(Precision::Minutes)[&(key(1), 0)];
        assert_eq!(row.count, 2);
        assert_eq!(row.sum, 4.0);
    }

    #[tokio::test]
    async fn test_empty_window_writes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let rollup =
            HostRollup::from_finer(store.clone(), store.clone(), Precision::Hours).unwrap();
        let summary = rollup
            .do_work(TimeRange::new(0, 3_600_000).unwrap())
            .await
            .unwrap();
        assert_eq!(summary, WorkSummary::default());
        assert!(store.host_rows(Precision::Hours).is_empty());
        assert_eq!(rollup.stats().empty_windows, 1);
    }

    #[test]
    fn test_minutes_not_built_from_aggregates() {
        let store = Arc::new(InMemoryStore::new());
        assert!(HostRollup::from_finer(store.clone(), store, Precision::Minutes).is_err());
    }

    #[tokio::test]
    async fn test_write_failure_propagates() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_points(&[RawPoint::new(key(1), 1_000, 2.0)]);
        store.fail_next_writes(1);

        let rollup = HostRollup::minute(store.clone(), store.clone());
        let err = rollup
            .do_work(TimeRange::new(0, 60_000).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AggregationError::Storage(_)));
    }
}
