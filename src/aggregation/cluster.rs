//! Cluster Aggregation
//!
//! Cross-host summaries of every metric.
//!
//! # Second level
//!
//! [`ClusterSecondAggregator`] cuts its window into fixed time slices
//! (30 seconds by default). Within a slice each host contributes the mean of
//! its points, and the host means are merged into one [`ClusterAggregate`]
//! per `(metric, app, instance)`:
//!
//! ```text
//!            slice 0        slice 1        slice 2
//! host1   ● ●  → 2.0     ●   → 4.0       ● ● ●  → 1.0
//! host2   ●    → 6.0         (none)      ●      → 3.0
//!         ──────────     ──────────      ──────────
//! cluster sum 8.0 n=2    sum 4.0 n=1     sum 4.0 n=2
//! ```
//!
//! Host resource metrics (`HOST` app id) are also re-attributed to every
//! allow-listed app running on the reporting host, and a `live_hosts` row
//! counts the distinct hosts per app and slice.
//!
//! # Coarser levels
//!
//! [`ClusterTimeRollup`] rolls cluster rows over time into the minute, hourly
//! and daily cluster tables.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::math::{fold_cluster, fold_host, ClusterAggregate, HostAggregate};
use super::{
    aligned_read_range, bucket_start, AggregatorStats, AggregatorStatsSnapshot, RollupWork,
    WorkSummary, DEFAULT_PARALLEL_THRESHOLD,
};
use crate::error::AggregationError;
use crate::metadata::SeriesIdentityCache;
use crate::storage::{
    AggregateReader, AggregateWriter, ClusterAggregateMap, ClusterMetric, ClusterTimeMap,
    RawPointReader,
};
use crate::types::{
    MetricIdentity, Precision, RawPoint, SeriesIdentity, TimeRange, Timestamp, HOST_APP_ID,
    LIVE_HOSTS_METRIC,
};

fn default_timeslice_ms() -> i64 {
    30_000
}

fn default_out_of_band_allowance_ms() -> i64 {
    300_000
}

fn default_parallel_threshold() -> usize {
    DEFAULT_PARALLEL_THRESHOLD
}

/// Configuration of the second-level cluster aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterAggregatorConfig {
    /// Slice width in milliseconds
    #[serde(default = "default_timeslice_ms")]
    pub timeslice_ms: i64,

    /// How far before the window start late points are still accepted
    #[serde(default = "default_out_of_band_allowance_ms")]
    pub out_of_band_allowance_ms: i64,

    /// Apps that also receive the host metrics of the hosts they run on
    #[serde(default)]
    pub cluster_app_ids: Vec<String>,

    /// Group count above which merging runs on the rayon pool
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,
}

impl Default for ClusterAggregatorConfig {
    fn default() -> Self {
        Self {
            timeslice_ms: default_timeslice_ms(),
            out_of_band_allowance_ms: default_out_of_band_allowance_ms(),
            cluster_app_ids: Vec::new(),
            parallel_threshold: default_parallel_threshold(),
        }
    }
}

// ============================================================================
// Second level
// ============================================================================

/// Running (sum, count) of one host inside one slice
type HostAccumulator = BTreeMap<String, (f64, u32)>;

/// Cross-host slicing of raw points
pub struct ClusterSecondAggregator {
    reader: Arc<dyn RawPointReader>,
    writer: Arc<dyn AggregateWriter>,
    cache: Arc<SeriesIdentityCache>,
    config: ClusterAggregatorConfig,
    app_allow_list: BTreeSet<String>,
    stats: AggregatorStats,
}

impl ClusterSecondAggregator {
    /// Create the aggregator
    pub fn new(
        reader: Arc<dyn RawPointReader>,
        writer: Arc<dyn AggregateWriter>,
        cache: Arc<SeriesIdentityCache>,
        config: ClusterAggregatorConfig,
    ) -> Result<Self, AggregationError> {
        if config.timeslice_ms <= 0 {
            return Err(AggregationError::InvalidWindow {
                start: 0,
                end: 0,
                reason: format!("time slice must be positive, got {}", config.timeslice_ms),
            });
        }
        let app_allow_list = config.cluster_app_ids.iter().cloned().collect();
        Ok(Self {
            reader,
            writer,
            cache,
            config,
            app_allow_list,
            stats: AggregatorStats::default(),
        })
    }

    /// Get statistics
    pub fn stats(&self) -> AggregatorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Identities a series contributes to: its own, plus each allow-listed app
    /// running on its host when it is a host metric
    fn attribution_targets(&self, series: &SeriesIdentity) -> Vec<MetricIdentity> {
        let mut targets = vec![series.metric.clone()];
        if series.metric.app_id == HOST_APP_ID && !self.app_allow_list.is_empty() {
            for app in self.cache.hosted_apps(&series.host_name) {
                if self.app_allow_list.contains(&app) {
                    targets.push(series.metric.with_app(&app));
                }
            }
        }
        targets
    }

    /// Build the per-slice, per-host accumulators for `window`
    fn slice_points(
        &self,
        points: &[RawPoint],
        window: TimeRange,
    ) -> BTreeMap<ClusterMetric, HostAccumulator> {
        let slice = self.config.timeslice_ms;
        let earliest = window.start - self.config.out_of_band_allowance_ms;

        let mut slices: BTreeMap<ClusterMetric, HostAccumulator> = BTreeMap::new();
        // Latest point per series inside the allowance period
        let mut late: BTreeMap<SeriesIdentity, (Timestamp, f64)> = BTreeMap::new();
        let mut unresolved = 0u64;

        for p in points {
            if p.timestamp < earliest || p.timestamp >= window.end {
                continue;
            }
            let Some(series) = self.cache.identity_of(&p.key) else {
                unresolved += 1;
                continue;
            };

            if p.timestamp < window.start {
                let entry = late.entry(series).or_insert((p.timestamp, p.value));
                if p.timestamp >= entry.0 {
                    *entry = (p.timestamp, p.value);
                }
                continue;
            }

            let slice_start = window.start + (p.timestamp - window.start) / slice * slice;
            for target in self.attribution_targets(&series) {
                let acc = slices
                    .entry(ClusterMetric::new(target, slice_start))
                    .or_default()
                    .entry(series.host_name.clone())
                    .or_insert((0.0, 0));
                acc.0 += p.value;
                acc.1 += 1;
            }
        }

        // A host silent in the first slice contributes its latest late point
        for (series, (_, value)) in late {
            for target in self.attribution_targets(&series) {
                slices
                    .entry(ClusterMetric::new(target, window.start))
                    .or_default()
                    .entry(series.host_name.clone())
                    .or_insert((value, 1));
            }
        }

        if unresolved > 0 {
            tracing::debug!(unresolved, window = %window, "Skipped points of unknown series");
            self.stats
                .unresolved_points
                .fetch_add(unresolved, std::sync::atomic::Ordering::Relaxed);
        }
        slices
    }

    /// Merge per-host slice means into cluster rows, plus `live_hosts` rows
    fn merge_slices(&self, slices: BTreeMap<ClusterMetric, HostAccumulator>) -> ClusterAggregateMap {
        let mut live: BTreeMap<(String, Timestamp), BTreeSet<String>> = BTreeMap::new();
        for (metric, hosts) in &slices {
            live.entry((metric.identity.app_id.clone(), metric.timestamp))
                .or_default()
                .extend(hosts.keys().cloned());
        }

        let merge = |(metric, hosts): (ClusterMetric, HostAccumulator)| {
            let means: Vec<ClusterAggregate> = hosts
                .values()
                .map(|(sum, count)| ClusterAggregate::from_host_value(sum / f64::from(*count)))
                .collect();
            (metric, fold_cluster(&means))
        };

        let mut rows: ClusterAggregateMap = if slices.len() > self.config.parallel_threshold {
            slices
                .into_par_iter()
                .map(merge)
                .collect::<Vec<_>>()
                .into_iter()
                .collect()
        } else {
            slices.into_iter().map(merge).collect()
        };

        for ((app_id, timestamp), hosts) in live {
            let n = hosts.len() as f64;
            rows.insert(
                ClusterMetric::new(MetricIdentity::new(LIVE_HOSTS_METRIC, app_id), timestamp),
                ClusterAggregate {
                    sum: n,
                    number_of_hosts: 1,
                    min: n,
                    max: n,
                    deviation: 0.0,
                },
            );
        }
        rows
    }

    /// Cluster rows for `window` from already-read points
    pub fn aggregate(&self, points: &[RawPoint], window: TimeRange) -> ClusterAggregateMap {
        self.merge_slices(self.slice_points(points, window))
    }
}

#[async_trait]
impl RollupWork for ClusterSecondAggregator {
    async fn do_work(&self, window: TimeRange) -> Result<WorkSummary, AggregationError> {
        if window.is_empty() {
            let summary = WorkSummary::default();
            self.stats.record(&summary);
            return Ok(summary);
        }

        let read_range = TimeRange {
            start: window.start - self.config.out_of_band_allowance_ms,
            end: window.end,
        };
        let points = self.reader.read_points(&[], read_range).await?;
        let rows = self.aggregate(&points, window);

        let rows_written = if rows.is_empty() {
            0
        } else {
            self.writer.write_cluster_aggregates(&rows).await?
        };

        tracing::debug!(
            window = %window,
            points = points.len(),
            rows_written,
            "Cluster slice aggregation finished"
        );

        let summary = WorkSummary {
            rows_read: points.len(),
            rows_written,
        };
        self.stats.record(&summary);
        Ok(summary)
    }
}

// ============================================================================
// Coarser levels
// ============================================================================

/// Time rollup of cluster rows into the minute, hourly or daily cluster table
pub struct ClusterTimeRollup {
    reader: Arc<dyn AggregateReader>,
    writer: Arc<dyn AggregateWriter>,
    target: Precision,
    parallel_threshold: usize,
    stats: AggregatorStats,
}

impl ClusterTimeRollup {
    /// Create a rollup into the `target` cluster table
    ///
    /// Minute rows are built from second rows, every coarser table from the
    /// next finer one.
    pub fn new(
        reader: Arc<dyn AggregateReader>,
        writer: Arc<dyn AggregateWriter>,
        target: Precision,
    ) -> Result<Self, AggregationError> {
        if target == Precision::Seconds {
            return Err(AggregationError::InvalidWindow {
                start: 0,
                end: 0,
                reason: "second cluster rows come from raw points".to_string(),
            });
        }
        Ok(Self {
            reader,
            writer,
            target,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
            stats: AggregatorStats::default(),
        })
    }

    /// Group count above which merging runs on the rayon pool
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    /// Get statistics
    pub fn stats(&self) -> AggregatorStatsSnapshot {
        self.stats.snapshot()
    }

    async fn read_samples(
        &self,
        range: TimeRange,
    ) -> Result<Vec<(ClusterMetric, HostAggregate)>, AggregationError> {
        let samples = match self.target {
            Precision::Minutes => self
                .reader
                .read_cluster_aggregates(range)
                .await?
                .into_iter()
                .map(|row| (row.metric, row.aggregate.as_time_sample()))
                .collect(),
            _ => {
                let finer = self.target.finer().unwrap_or(Precision::Minutes);
                self.reader
                    .read_cluster_time_aggregates(finer, range)
                    .await?
                    .into_iter()
                    .map(|row| (row.metric, row.aggregate))
                    .collect()
            },
        };
        Ok(samples)
    }
}

/// Roll cluster samples into `bucket_ms` rows
pub fn rollup_cluster_samples(
    samples: Vec<(ClusterMetric, HostAggregate)>,
    bucket_ms: i64,
    parallel_threshold: usize,
) -> ClusterTimeMap {
    let mut groups: BTreeMap<ClusterMetric, Vec<HostAggregate>> = BTreeMap::new();
    for (metric, sample) in samples {
        let bucket = bucket_start(metric.timestamp, bucket_ms);
        groups
            .entry(ClusterMetric::new(metric.identity, bucket))
            .or_default()
            .push(sample);
    }

    if groups.len() > parallel_threshold {
        groups
            .into_par_iter()
            .map(|(m, aggs)| (m, fold_host(&aggs)))
            .collect::<Vec<_>>()
            .into_iter()
            .collect()
    } else {
        groups
            .into_iter()
            .map(|(m, aggs)| (m, fold_host(&aggs)))
            .collect()
    }
}

#[async_trait]
impl RollupWork for ClusterTimeRollup {
    async fn do_work(&self, window: TimeRange) -> Result<WorkSummary, AggregationError> {
        let bucket = self.target.bucket_millis();
        let samples = self.read_samples(aligned_read_range(window, bucket)).await?;
        let rows_read = samples.len();
        let rows = rollup_cluster_samples(samples, bucket, self.parallel_threshold);

        let rows_written = if rows.is_empty() {
            0
        } else {
            self.writer
                .write_cluster_time_aggregates(self.target, &rows)
                .await?
        };

        tracing::debug!(
            target_precision = %self.target,
            window = %window,
            rows_read,
            rows_written,
            "Cluster time rollup finished"
        );

        let summary = WorkSummary {
            rows_read,
            rows_written,
        };
        self.stats.record(&summary);
        Ok(summary)
    }
}
