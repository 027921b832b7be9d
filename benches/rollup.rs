//! Rollup Benchmarks
//!
//! Host bucketing, aggregate folding, cross-host slicing and Top-N ranking
//! over synthetic series.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kuba_rollup::aggregation::host::rollup_points;
use kuba_rollup::aggregation::math::fold_host;
use kuba_rollup::aggregation::{ClusterAggregatorConfig, ClusterSecondAggregator, HostAggregate};
use kuba_rollup::metadata::SeriesIdentityCache;
use kuba_rollup::query::{rank_series, TopNFunction, TopNSpec};
use kuba_rollup::storage::InMemoryStore;
use kuba_rollup::types::{HostKey, MetricIdentity, MetricKey, RawPoint, RowKey, SeriesKey, TimeRange};

const BASE_TS: i64 = 1_700_000_040_000;

// =============================================================================
// Test Data Generators
// =============================================================================

fn series_key(metric: u8, host: u32) -> SeriesKey {
    SeriesKey::new(MetricKey([metric; 16]), HostKey(host.to_be_bytes()))
}

/// Points every 10 seconds for `series` series over `minutes` minutes
fn create_points(series: u32, minutes: i64) -> Vec<RawPoint> {
    (0..series)
        .flat_map(|s| {
            (0..minutes * 6).map(move |i| {
                RawPoint::new(
                    series_key((s % 16) as u8, s),
                    BASE_TS + i * 10_000,
                    50.0 + (i as f64 * 0.1).sin() * 10.0 + s as f64,
                )
            })
        })
        .collect()
}

// =============================================================================
// Host Rollup Benchmarks
// =============================================================================

fn bench_host_rollup(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_minute_rollup");

    for series in [10u32, 100, 1000] {
        let points = create_points(series, 5);
        group.throughput(Throughput::Elements(points.len() as u64));

        group.bench_with_input(BenchmarkId::new("sequential", series), &points, |b, pts| {
            b.iter(|| rollup_points(black_box(pts), 60_000, usize::MAX))
        });
        group.bench_with_input(BenchmarkId::new("rayon", series), &points, |b, pts| {
            b.iter(|| rollup_points(black_box(pts), 60_000, 0))
        });
    }

    group.finish();
}

fn bench_fold(c: &mut Criterion) {
    let mut group = c.benchmark_group("fold_host");

    for n in [60usize, 1440] {
        let rows: Vec<HostAggregate> = (0..n)
            .map(|i| HostAggregate::from_values(&[i as f64, i as f64 + 1.0, i as f64 * 0.5]))
            .collect();
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &rows, |b, rows| {
            b.iter(|| fold_host(black_box(rows)))
        });
    }

    group.finish();
}

// =============================================================================
// Cluster Slicing Benchmarks
// =============================================================================

fn bench_cluster_slices(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("cluster_second_slices");

    for hosts in [10usize, 100, 500] {
        let cache = Arc::new(SeriesIdentityCache::in_memory());
        let points: Vec<RawPoint> = rt.block_on(async {
            let mut points = Vec::new();
            for h in 0..hosts {
                for metric in ["cpu_user", "mem_free", "load_one"] {
                    let id = MetricIdentity::new(metric, "HOST").on_host(format!("host{}", h));
                    let key = cache.get_or_assign_key(&id).await.unwrap();
                    for i in 0..12 {
                        points.push(RawPoint::new(key, BASE_TS + i * 10_000, h as f64 + i as f64));
                    }
                }
            }
            points
        });

        let store = Arc::new(InMemoryStore::new());
        let aggregator = ClusterSecondAggregator::new(
            store.clone(),
            store,
            cache,
            ClusterAggregatorConfig::default(),
        )
        .unwrap();
        let window = TimeRange::new(BASE_TS, BASE_TS + 120_000).unwrap();

        group.throughput(Throughput::Elements(points.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(hosts), &points, |b, pts| {
            b.iter(|| aggregator.aggregate(black_box(pts), window))
        });
    }

    group.finish();
}

// =============================================================================
// Top-N Ranking Benchmarks
// =============================================================================

fn bench_rank(c: &mut Criterion) {
    let rows: Vec<(RowKey, HostAggregate)> = (0..2000u32)
        .flat_map(|h| {
            (0..10).map(move |i| {
                (
                    RowKey::Series(series_key(1, h)),
                    HostAggregate::from_value((h * 7 % 101) as f64 + i as f64),
                )
            })
        })
        .collect();

    c.bench_function("rank_top_10_of_2000_hosts", |b| {
        b.iter(|| rank_series(black_box(&rows), &TopNSpec::top(10, TopNFunction::Avg)))
    });
}

criterion_group!(benches, bench_host_rollup, bench_fold, bench_cluster_slices, bench_rank);
criterion_main!(benches);
