//! Prometheus metrics for the rollup engine
//!
//! Rollup levels, the query planner and the identity cache report through
//! the helpers below. Labels are level names (`host-minute`, ...) and
//! precision names (`SECONDS`, ...), so cardinality stays fixed.
//!
//! The daemon exports the registry periodically with [`export`]: to a
//! textfile collector file when one is configured, to the log otherwise.

use std::io;
use std::path::Path;
use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};

lazy_static! {
    // === Rollup Cycles ===

    /// Cycles by level and outcome
    pub static ref ROLLUP_CYCLES_TOTAL: CounterVec = register_counter_vec!(
        "rollup_cycles_total",
        "Rollup cycles run, by outcome",
        &["level", "outcome"]
    ).unwrap();

    /// Failed cycles
    pub static ref ROLLUP_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "rollup_failures_total",
        "Rollup cycles that failed and will be retried",
        &["level"]
    ).unwrap();

    /// Windows skipped because the level fell too far behind
    pub static ref ROLLUP_LAG_EVENTS_TOTAL: CounterVec = register_counter_vec!(
        "rollup_lag_events_total",
        "Spans skipped because the level lagged beyond its cutoff",
        &["level"]
    ).unwrap();

    /// Cycle duration
    pub static ref ROLLUP_CYCLE_DURATION: HistogramVec = register_histogram_vec!(
        "rollup_cycle_duration_seconds",
        "Rollup cycle latency in seconds",
        &["level"],
        vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
    ).unwrap();

    /// Last persisted checkpoint
    pub static ref ROLLUP_CHECKPOINT_MS: GaugeVec = register_gauge_vec!(
        "rollup_checkpoint_ms",
        "Last persisted checkpoint in epoch milliseconds",
        &["level"]
    ).unwrap();

    /// Rows written
    pub static ref ROLLUP_ROWS_WRITTEN_TOTAL: CounterVec = register_counter_vec!(
        "rollup_rows_written_total",
        "Aggregate rows written",
        &["level"]
    ).unwrap();

    // === Planner ===

    /// Queries rejected for returning too many points
    pub static ref PLANNER_LIMIT_EXCEEDED_TOTAL: CounterVec = register_counter_vec!(
        "planner_limit_exceeded_total",
        "Queries rejected because the estimated result exceeds the limit",
        &["precision"]
    ).unwrap();

    // === Series Keys ===

    /// New series keys
    pub static ref SERIES_KEYS_ASSIGNED_TOTAL: Counter = register_counter!(
        "series_keys_assigned_total",
        "Series keys assigned to new tuples"
    ).unwrap();

    /// Key collisions
    pub static ref SERIES_KEY_COLLISIONS_TOTAL: Counter = register_counter!(
        "series_key_collisions_total",
        "Derived series keys already owned by another tuple"
    ).unwrap();

    // === Process ===

    /// 1 while the daemon runs its levels
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "rollup_health_status",
        "Daemon health (1 = running, 0 = stopped)"
    ).unwrap();
}

/// Initialize metrics system
pub fn init() {
    HEALTH_STATUS.set(1.0);
    tracing::info!("Metrics system initialized");
}

/// Mark the daemon stopped
pub fn shutdown() {
    HEALTH_STATUS.set(0.0);
    tracing::debug!("Metrics system stopped");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Replace `path` with the current text exposition
///
/// The text is written next to `path` first and renamed over it, so a
/// collector never reads a partial file.
pub async fn write_metrics_file(path: &Path) -> io::Result<()> {
    let text = gather_metrics().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    tokio::fs::write(&temp, text).await?;
    tokio::fs::rename(&temp, path).await
}

/// Export the registry to `target`, or to the debug log without one
pub async fn export(target: Option<&Path>) {
    match target {
        Some(path) => {
            if let Err(e) = write_metrics_file(path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to export metrics");
            }
        },
        None => match gather_metrics() {
            Ok(text) => tracing::debug!(metrics = %text, "Metrics snapshot"),
            Err(e) => tracing::warn!(error = %e, "Failed to gather metrics"),
        },
    }
}

/// Record a finished cycle
#[inline]
pub fn record_cycle(level: &str, outcome: &str, elapsed: Duration) {
    ROLLUP_CYCLES_TOTAL.with_label_values(&[level, outcome]).inc();
    ROLLUP_CYCLE_DURATION
        .with_label_values(&[level])
        .observe(elapsed.as_secs_f64());
}

/// Record a failed cycle
#[inline]
pub fn record_failure(level: &str) {
    ROLLUP_FAILURES_TOTAL.with_label_values(&[level]).inc();
}

/// Record a lag skip
#[inline]
pub fn record_lag_event(level: &str) {
    ROLLUP_LAG_EVENTS_TOTAL.with_label_values(&[level]).inc();
}

/// Record rows written by one cycle
#[inline]
pub fn record_rows_written(level: &str, rows: usize) {
    ROLLUP_ROWS_WRITTEN_TOTAL
        .with_label_values(&[level])
        .inc_by(rows as f64);
}

/// Publish a persisted checkpoint
#[inline]
pub fn set_checkpoint(level: &str, checkpoint: i64) {
    ROLLUP_CHECKPOINT_MS
        .with_label_values(&[level])
        .set(checkpoint as f64);
}

/// Record a query rejected by the result limit
#[inline]
pub fn record_limit_exceeded(precision: &str) {
    PLANNER_LIMIT_EXCEEDED_TOTAL
        .with_label_values(&[precision])
        .inc();
}

/// Record a new series key
#[inline]
pub fn record_key_assigned() {
    SERIES_KEYS_ASSIGNED_TOTAL.inc();
}

/// Record a series key collision
#[inline]
pub fn record_key_collision() {
    SERIES_KEY_COLLISIONS_TOTAL.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_follows_lifecycle() {
        init();
        assert_eq!(HEALTH_STATUS.get(), 1.0);
        shutdown();
        assert_eq!(HEALTH_STATUS.get(), 0.0);
    }

    #[test]
    fn test_record_cycle() {
        record_cycle("test_level", "aggregated", Duration::from_millis(5));
        record_rows_written("test_level", 3);
        let metrics = gather_metrics().expect("Failed to gather metrics");
        assert!(metrics.contains("rollup_cycles_total"));
        assert!(metrics.contains("rollup_rows_written_total"));
    }

    #[tokio::test]
    async fn test_metrics_file_export() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rollup.prom");

        record_failure("test-export-level");
        export(Some(&path)).await;
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("rollup_failures_total{level=\"test-export-level\"} 1"));
        assert!(!dir.path().join("rollup.prom.tmp").exists());

        // Rewritten in place on the next export
        record_failure("test-export-level");
        export(Some(&path)).await;
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("rollup_failures_total{level=\"test-export-level\"} 2"));
    }

    #[test]
    fn test_checkpoint_gauge() {
        set_checkpoint("test_gauge_level", 1_700_000_000_000);
        assert_eq!(
            ROLLUP_CHECKPOINT_MS
                .with_label_values(&["test_gauge_level"])
                .get(),
            1_700_000_000_000.0
        );
    }
}
