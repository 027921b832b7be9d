//! Core data types shared by the rollup engine
//!
//! # Key Types
//!
//! - **`Precision`**: rollup granularity (seconds, minutes, hours, days) and the
//!   table each granularity lives in
//! - **`TimeRange`**: half-open `[start, end)` window in epoch milliseconds
//! - **`MetricIdentity`**: (metric name, app id, instance id), the identity of a
//!   cluster-level series
//! - **`SeriesIdentity`**: a `MetricIdentity` reported by one host
//! - **`MetricKey` / `HostKey` / `SeriesKey`**: compact fixed-width row keys
//! - **`RawPoint`**: a single measurement as written by ingestion
//!
//! # Example
//!
//! ```rust
//! use kuba_rollup::types::{Precision, TimeRange};
//!
//! let range = TimeRange::new(0, 60_000).unwrap();
//! assert!(range.contains(59_999));
//! assert!(!range.contains(60_000));
//! assert_eq!(Precision::Minutes.host_table(), "METRIC_RECORD_MINUTE_UUID");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Epoch timestamp in milliseconds
pub type Timestamp = i64;

/// App id under which host-level resource metrics (cpu, disk, memory) are reported
pub const HOST_APP_ID: &str = "HOST";

/// Metric name of the synthetic per-app live host count
pub const LIVE_HOSTS_METRIC: &str = "live_hosts";

/// Anything below this is a seconds timestamp, not milliseconds
const SECONDS_TIMESTAMP_CEILING: i64 = 9_999_999_999;

/// Normalize a caller-supplied timestamp to milliseconds
///
/// Clients sometimes send epoch seconds. Values small enough to be seconds are
/// scaled up so both forms address the same instant.
pub fn normalize_timestamp(ts: Timestamp) -> Timestamp {
    if ts > 0 && ts < SECONDS_TIMESTAMP_CEILING {
        ts * 1000
    } else {
        ts
    }
}

// ============================================================================
// Precision
// ============================================================================

/// Rollup granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Precision {
    /// Raw host points / 30 second cluster slices
    Seconds,
    /// Minute rollups
    Minutes,
    /// Hourly rollups
    Hours,
    /// Daily rollups
    Days,
}

impl Precision {
    /// Precision ladder, finest to coarsest
    pub const LADDER: [Precision; 4] = [
        Precision::Seconds,
        Precision::Minutes,
        Precision::Hours,
        Precision::Days,
    ];

    /// Upper-case name used in messages and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Seconds => "SECONDS",
            Precision::Minutes => "MINUTES",
            Precision::Hours => "HOURS",
            Precision::Days => "DAYS",
        }
    }

    /// Table holding per-host rows at this precision
    pub fn host_table(&self) -> &'static str {
        match self {
            Precision::Seconds => "METRIC_RECORD_UUID",
            Precision::Minutes => "METRIC_RECORD_MINUTE_UUID",
            Precision::Hours => "METRIC_RECORD_HOURLY_UUID",
            Precision::Days => "METRIC_RECORD_DAILY_UUID",
        }
    }

    /// Table holding cross-host rows at this precision
    pub fn cluster_table(&self) -> &'static str {
        match self {
            Precision::Seconds => "METRIC_AGGREGATE_UUID",
            Precision::Minutes => "METRIC_AGGREGATE_MINUTE_UUID",
            Precision::Hours => "METRIC_AGGREGATE_HOURLY_UUID",
            Precision::Days => "METRIC_AGGREGATE_DAILY_UUID",
        }
    }

    /// Table for this precision, host or cluster flavour
    pub fn table_name(&self, with_hosts: bool) -> &'static str {
        if with_hosts {
            self.host_table()
        } else {
            self.cluster_table()
        }
    }

    /// Width of one output bucket when rolling up into this precision
    pub fn bucket_millis(&self) -> i64 {
        match self {
            Precision::Seconds => 1_000,
            Precision::Minutes => 60_000,
            Precision::Hours => 3_600_000,
            Precision::Days => 86_400_000,
        }
    }

    /// The next finer precision, if any
    pub fn finer(&self) -> Option<Precision> {
        match self {
            Precision::Seconds => None,
            Precision::Minutes => Some(Precision::Seconds),
            Precision::Hours => Some(Precision::Minutes),
            Precision::Days => Some(Precision::Hours),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "seconds" | "second" | "s" => Ok(Precision::Seconds),
            "minutes" | "minute" | "m" => Ok(Precision::Minutes),
            "hours" | "hour" | "h" => Ok(Precision::Hours),
            "days" | "day" | "d" => Ok(Precision::Days),
            other => Err(format!(
                "Unknown precision '{}', expected one of seconds, minutes, hours, days",
                other
            )),
        }
    }
}

// ============================================================================
// Time Range
// ============================================================================

/// Half-open time window `[start, end)` in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start
    pub start: Timestamp,
    /// Exclusive end
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a range, rejecting `start > end`
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self, String> {
        if start > end {
            return Err(format!(
                "Invalid time range: start {} is after end {}",
                start, end
            ));
        }
        Ok(Self { start, end })
    }

    /// Whether `ts` falls inside the window
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Window length in milliseconds
    pub fn duration_ms(&self) -> i64 {
        self.end - self.start
    }

    /// Zero-width window
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ============================================================================
// Identities
// ============================================================================

/// Identity of a metric independent of the host reporting it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricIdentity {
    /// Metric name, e.g. `cpu_user`
    pub metric_name: String,
    /// Application id, e.g. `HOST` or `namenode`
    pub app_id: String,
    /// Optional instance id for multi-instance apps
    pub instance_id: Option<String>,
}

impl MetricIdentity {
    /// Create an identity without an instance id
    pub fn new(metric_name: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            metric_name: metric_name.into(),
            app_id: app_id.into(),
            instance_id: None,
        }
    }

    /// Set the instance id
    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Same metric re-attributed to another app
    pub fn with_app(&self, app_id: &str) -> Self {
        Self {
            metric_name: self.metric_name.clone(),
            app_id: app_id.to_string(),
            instance_id: self.instance_id.clone(),
        }
    }

    /// Attach a host
    pub fn on_host(self, host_name: impl Into<String>) -> SeriesIdentity {
        SeriesIdentity {
            metric: self,
            host_name: host_name.into(),
        }
    }
}

impl fmt::Display for MetricIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance_id {
            Some(instance) => write!(f, "{}/{}/{}", self.app_id, instance, self.metric_name),
            None => write!(f, "{}/{}", self.app_id, self.metric_name),
        }
    }
}

/// A metric as reported by a single host
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesIdentity {
    /// The host-independent part
    pub metric: MetricIdentity,
    /// Reporting host
    pub host_name: String,
}

impl fmt::Display for SeriesIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.metric, self.host_name)
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Width of a metric key in bytes
pub const METRIC_KEY_LEN: usize = 16;
/// Width of a host key in bytes
pub const HOST_KEY_LEN: usize = 4;
/// Width of a full series key in bytes
pub const SERIES_KEY_LEN: usize = METRIC_KEY_LEN + HOST_KEY_LEN;

/// 16-byte key of a `MetricIdentity`; row key of cluster tables
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricKey(pub [u8; METRIC_KEY_LEN]);

/// 4-byte key of a host name
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostKey(pub [u8; HOST_KEY_LEN]);

/// 20-byte row key of host tables: metric key followed by host key
///
/// Laying the metric key first keeps all hosts of one metric adjacent in
/// key order, which is what range scans by metric rely on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey(pub [u8; SERIES_KEY_LEN]);

impl SeriesKey {
    /// Concatenate a metric key and host key
    pub fn new(metric: MetricKey, host: HostKey) -> Self {
        let mut bytes = [0u8; SERIES_KEY_LEN];
        bytes[..METRIC_KEY_LEN].copy_from_slice(&metric.0);
        bytes[METRIC_KEY_LEN..].copy_from_slice(&host.0);
        Self(bytes)
    }

    /// Metric half of the key
    pub fn metric_key(&self) -> MetricKey {
        let mut bytes = [0u8; METRIC_KEY_LEN];
        bytes.copy_from_slice(&self.0[..METRIC_KEY_LEN]);
        MetricKey(bytes)
    }

    /// Host half of the key
    pub fn host_key(&self) -> HostKey {
        let mut bytes = [0u8; HOST_KEY_LEN];
        bytes.copy_from_slice(&self.0[METRIC_KEY_LEN..]);
        HostKey(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MetricKey({})", self)
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostKey({})", self)
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeriesKey({})", self)
    }
}

/// Row key of either table family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowKey {
    /// Host table key
    Series(SeriesKey),
    /// Cluster table key
    Metric(MetricKey),
}

impl RowKey {
    /// Raw bytes as bound into a predicate
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RowKey::Series(k) => &k.0,
            RowKey::Metric(k) => &k.0,
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Series(k) => k.fmt(f),
            RowKey::Metric(k) => k.fmt(f),
        }
    }
}

// ============================================================================
// Raw Point
// ============================================================================

/// A single raw measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawPoint {
    /// Series the point belongs to
    pub key: SeriesKey,
    /// Measurement time (epoch ms)
    pub timestamp: Timestamp,
    /// Measured value
    pub value: f64,
}

impl RawPoint {
    /// Create a new raw point
    pub fn new(key: SeriesKey, timestamp: Timestamp, value: f64) -> Self {
        Self {
            key,
            timestamp,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_tables() {
        assert_eq!(Precision::Seconds.table_name(true), "METRIC_RECORD_UUID");
        assert_eq!(Precision::Seconds.table_name(false), "METRIC_AGGREGATE_UUID");
        assert_eq!(Precision::Days.cluster_table(), "METRIC_AGGREGATE_DAILY_UUID");
        assert_eq!(Precision::Hours.finer(), Some(Precision::Minutes));
        assert_eq!(Precision::Seconds.finer(), None);
    }

    #[test]
    fn test_precision_parse() {
        assert_eq!("MINUTES".parse::<Precision>().unwrap(), Precision::Minutes);
        assert_eq!("hour".parse::<Precision>().unwrap(), Precision::Hours);
        assert!("weeks".parse::<Precision>().is_err());
    }

    #[test]
    fn test_time_range() {
        assert!(TimeRange::new(10, 5).is_err());
        let r = TimeRange::new(0, 0).unwrap();
        assert!(r.is_empty());
        assert!(!r.contains(0));
    }

    #[test]
    fn test_normalize_timestamp() {
        assert_eq!(normalize_timestamp(1_407_959_718), 1_407_959_718_000);
        assert_eq!(normalize_timestamp(1_407_959_718_000), 1_407_959_718_000);
        assert_eq!(normalize_timestamp(0), 0);
    }

    #[test]
    fn test_series_key_split() {
        let metric = MetricKey([7u8; METRIC_KEY_LEN]);
        let host = HostKey([1, 2, 3, 4]);
        let key = SeriesKey::new(metric, host);
        assert_eq!(key.metric_key(), metric);
        assert_eq!(key.host_key(), host);
        assert_eq!(key.as_bytes().len(), SERIES_KEY_LEN);
        assert!(key.to_string().ends_with("01020304"));
    }
}
