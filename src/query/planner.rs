//! Query Condition Planner
//!
//! Turns a [`QueryRequest`] into a [`Condition`]: the precision to read, the
//! table holding it, and the series filter.
//!
//! # Precision selection
//!
//! ```text
//! SECONDS ──▶ MINUTES ──▶ HOURS ──▶ DAYS
//!    │           │          │         │
//!    └─ first level whose estimate fits the result limit
//!       and whose retention still covers the requested start
//! ```
//!
//! The estimate is `series × (range / data interval)`, where `series` is
//! `metrics × max(1, hosts)` or, when wildcards match more than that, the
//! number of series resolved from the cache. An explicit precision skips
//! the walk: it is only checked against the limit.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::metadata::SeriesIdentityCache;
use crate::metrics;
use crate::query::condition::{Condition, PatternFilter, SeriesFilter, TopNKind, TopNSpec};
use crate::query::error::PlanError;
use crate::types::{normalize_timestamp, Precision, RowKey, TimeRange, Timestamp};

const MILLIS_PER_DAY: i64 = 86_400_000;

// ============================================================================
// Planner Configuration
// ============================================================================

/// One value per precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerPrecision {
    /// SECONDS
    pub seconds: i64,
    /// MINUTES
    pub minutes: i64,
    /// HOURS
    pub hours: i64,
    /// DAYS
    pub days: i64,
}

impl PerPrecision {
    /// Value for `precision`
    pub fn get(&self, precision: Precision) -> i64 {
        match precision {
            Precision::Seconds => self.seconds,
            Precision::Minutes => self.minutes,
            Precision::Hours => self.hours,
            Precision::Days => self.days,
        }
    }
}

fn default_result_limit() -> u64 {
    10_000
}

fn default_data_interval_secs() -> PerPrecision {
    PerPrecision {
        seconds: 10,
        minutes: 60,
        hours: 3_600,
        days: 86_400,
    }
}

fn default_host_ttl_days() -> PerPrecision {
    PerPrecision {
        seconds: 1,
        minutes: 7,
        hours: 30,
        days: 365,
    }
}

fn default_cluster_ttl_days() -> PerPrecision {
    PerPrecision {
        seconds: 7,
        minutes: 30,
        hours: 365,
        days: 730,
    }
}

fn default_max_in_clause_keys() -> usize {
    1_000
}

/// Configuration for query planning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlannerConfig {
    /// Largest result a query may return (default: 10000)
    #[serde(default = "default_result_limit")]
    pub result_limit: u64,

    /// Expected spacing of stored rows per precision, in seconds
    #[serde(default = "default_data_interval_secs")]
    pub data_interval_secs: PerPrecision,

    /// Retention of host tables, in days
    #[serde(default = "default_host_ttl_days")]
    pub host_ttl_days: PerPrecision,

    /// Retention of cluster tables, in days
    #[serde(default = "default_cluster_ttl_days")]
    pub cluster_ttl_days: PerPrecision,

    /// Above this many resolved keys the filter falls back to name patterns
    #[serde(default = "default_max_in_clause_keys")]
    pub max_in_clause_keys: usize,
}

impl Default for QueryPlannerConfig {
    fn default() -> Self {
        Self {
            result_limit: default_result_limit(),
            data_interval_secs: default_data_interval_secs(),
            host_ttl_days: default_host_ttl_days(),
            cluster_ttl_days: default_cluster_ttl_days(),
            max_in_clause_keys: default_max_in_clause_keys(),
        }
    }
}

impl QueryPlannerConfig {
    /// Check the configuration for obviously broken values
    pub fn validate(&self) -> Result<(), String> {
        if self.result_limit == 0 {
            return Err("result_limit must be > 0".to_string());
        }
        if self.max_in_clause_keys == 0 {
            return Err("max_in_clause_keys must be > 0".to_string());
        }
        for precision in Precision::LADDER {
            if self.data_interval_secs.get(precision) <= 0 {
                return Err(format!("data interval for {} must be > 0", precision));
            }
            if self.host_ttl_days.get(precision) <= 0 || self.cluster_ttl_days.get(precision) <= 0
            {
                return Err(format!("ttl for {} must be > 0", precision));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Query Request
// ============================================================================

/// A metrics query as received from a client
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// Metric names, `%` allowed
    pub metric_names: Vec<String>,
    /// Host names, `%` allowed; empty reads cluster tables
    pub host_names: Vec<String>,
    /// Exact app id
    pub app_id: Option<String>,
    /// Exact instance id
    pub instance_id: Option<String>,
    /// Requested window, normalized to milliseconds
    pub range: TimeRange,
    /// Explicit precision
    pub precision: Option<Precision>,
    /// Row limit
    pub limit: Option<usize>,
    /// Group rows per series
    pub grouped: bool,
    /// Top-N ranking
    pub top_n: Option<TopNSpec>,
}

impl QueryRequest {
    /// Start building a request
    pub fn builder() -> QueryRequestBuilder {
        QueryRequestBuilder::default()
    }

    /// Every series of the cluster tables over `range`
    pub fn scan(range: TimeRange) -> Self {
        Self {
            metric_names: Vec::new(),
            host_names: Vec::new(),
            app_id: None,
            instance_id: None,
            range,
            precision: None,
            limit: None,
            grouped: true,
            top_n: None,
        }
    }

    /// Whether host tables are read
    pub fn with_hosts(&self) -> bool {
        !self.host_names.is_empty()
    }
}

/// Builder for [`QueryRequest`]
#[derive(Debug, Clone)]
pub struct QueryRequestBuilder {
    metric_names: Vec<String>,
    host_names: Vec<String>,
    app_id: Option<String>,
    instance_id: Option<String>,
    start_time: Option<Timestamp>,
    end_time: Option<Timestamp>,
    precision: Option<Precision>,
    limit: Option<usize>,
    grouped: bool,
    top_n: Option<TopNSpec>,
}

impl Default for QueryRequestBuilder {
    fn default() -> Self {
        Self {
            metric_names: Vec::new(),
            host_names: Vec::new(),
            app_id: None,
            instance_id: None,
            start_time: None,
            end_time: None,
            precision: None,
            limit: None,
            grouped: true,
            top_n: None,
        }
    }
}

impl QueryRequestBuilder {
    /// Add a metric name or pattern
    pub fn metric(mut self, name: impl Into<String>) -> Self {
        self.metric_names.push(name.into());
        self
    }

    /// Add several metric names
    pub fn metrics<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metric_names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Add a host name or pattern
    pub fn host(mut self, name: impl Into<String>) -> Self {
        self.host_names.push(name.into());
        self
    }

    /// Add several host names
    pub fn hosts<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.host_names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Restrict to one app
    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    /// Restrict to one instance
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Window start, epoch seconds or milliseconds
    pub fn start_time(mut self, ts: Timestamp) -> Self {
        self.start_time = Some(ts);
        self
    }

    /// Window end, epoch seconds or milliseconds
    pub fn end_time(mut self, ts: Timestamp) -> Self {
        self.end_time = Some(ts);
        self
    }

    /// Both window bounds at once
    pub fn time_range(self, range: TimeRange) -> Self {
        self.start_time(range.start).end_time(range.end)
    }

    /// Force a precision
    pub fn precision(mut self, precision: Precision) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Limit the number of rows
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Group rows per series (default: true)
    pub fn grouped(mut self, grouped: bool) -> Self {
        self.grouped = grouped;
        self
    }

    /// Rank series and keep the best few
    pub fn top_n(mut self, spec: TopNSpec) -> Self {
        self.top_n = Some(spec);
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<QueryRequest, PlanError> {
        if self.metric_names.is_empty() {
            return Err(PlanError::EmptyMetricNames);
        }

        let range = match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => {
                TimeRange::new(normalize_timestamp(start), normalize_timestamp(end)).map_err(
                    |_| PlanError::InvalidTimeRange {
                        start: self.start_time,
                        end: self.end_time,
                    },
                )?
            },
            (start, end) => return Err(PlanError::InvalidTimeRange { start, end }),
        };

        Ok(QueryRequest {
            metric_names: self.metric_names,
            host_names: self.host_names,
            app_id: self.app_id,
            instance_id: self.instance_id,
            range,
            precision: self.precision,
            limit: self.limit,
            grouped: self.grouped,
            top_n: self.top_n,
        })
    }
}

// ============================================================================
// Query Planner
// ============================================================================

/// Result of planning
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    /// The request planned as asked
    Planned(Condition),

    /// Top-N was requested for a shape that cannot be ranked; the plain
    /// condition is returned instead
    InvalidTopN {
        /// Condition without the ranking
        fallback: Condition,
    },
}

impl PlanOutcome {
    /// The condition to run
    pub fn condition(&self) -> &Condition {
        match self {
            PlanOutcome::Planned(c) => c,
            PlanOutcome::InvalidTopN { fallback } => fallback,
        }
    }

    /// Take the condition to run
    pub fn into_condition(self) -> Condition {
        match self {
            PlanOutcome::Planned(c) => c,
            PlanOutcome::InvalidTopN { fallback } => fallback,
        }
    }

    /// Whether the request planned as asked
    pub fn is_planned(&self) -> bool {
        matches!(self, PlanOutcome::Planned(_))
    }
}

/// Chooses precision, table and filter for query requests
#[derive(Debug)]
pub struct QueryPlanner {
    cache: Arc<SeriesIdentityCache>,
    config: QueryPlannerConfig,
}

impl QueryPlanner {
    /// Create a planner resolving names through `cache`
    pub fn new(cache: Arc<SeriesIdentityCache>, config: QueryPlannerConfig) -> Self {
        Self { cache, config }
    }

    /// Planner configuration
    pub fn config(&self) -> &QueryPlannerConfig {
        &self.config
    }

    /// Plan `request` against the current wall clock
    pub fn plan(&self, request: &QueryRequest) -> Result<PlanOutcome, PlanError> {
        self.plan_at(request, chrono::Utc::now().timestamp_millis())
    }

    /// Plan `request` as if the time were `now`
    pub fn plan_at(&self, request: &QueryRequest, now: Timestamp) -> Result<PlanOutcome, PlanError> {
        if let Some(limit) = request.limit {
            if limit as u64 > self.config.result_limit {
                return Err(PlanError::LimitTooBig {
                    limit,
                    max: self.config.result_limit,
                });
            }
        }

        let keys = self.resolve(request)?;
        let series = SeriesCount::of(request, &keys);
        let precision = self.choose_precision(request, series, now)?;
        let with_hosts = request.with_hosts();

        let mut condition = Condition {
            precision,
            table: precision.table_name(with_hosts),
            filter: self.series_filter(request, keys),
            range: request.range,
            limit: request.limit,
            no_limit: request.precision.is_some(),
            grouped: request.grouped,
            estimated_points: self.estimate(series, request.range, precision),
        };

        let Some(spec) = request.top_n else {
            return Ok(PlanOutcome::Planned(condition));
        };

        match TopNKind::classify(&request.metric_names, &request.host_names) {
            Some(kind) => {
                condition.filter = condition.filter.into_top_n(kind, spec);
                tracing::debug!(
                    table = condition.table,
                    precision = %condition.precision,
                    kind = ?kind,
                    n = spec.n,
                    "Planned Top-N query"
                );
                Ok(PlanOutcome::Planned(condition))
            },
            None => {
                tracing::debug!(
                    metrics = request.metric_names.len(),
                    hosts = request.host_names.len(),
                    "Top-N not applicable, falling back to plain condition"
                );
                Ok(PlanOutcome::InvalidTopN {
                    fallback: condition,
                })
            },
        }
    }

    /// Estimated result rows for `request` at `precision`, counting the
    /// series its wildcards match in the cache
    pub fn estimate_points(&self, request: &QueryRequest, precision: Precision) -> Result<u64, PlanError> {
        let keys = self.resolve(request)?;
        Ok(self.estimate(SeriesCount::of(request, &keys), request.range, precision))
    }

    fn estimate(&self, series: SeriesCount, range: TimeRange, precision: Precision) -> u64 {
        let range_secs = (range.duration_ms() / 1000).max(0);
        let interval = self.config.data_interval_secs.get(precision).max(1);
        series.total.saturating_mul((range_secs / interval) as u64)
    }

    fn ttl_covers(&self, request: &QueryRequest, precision: Precision, now: Timestamp) -> bool {
        let ttl_days = if request.with_hosts() {
            self.config.host_ttl_days.get(precision)
        } else {
            self.config.cluster_ttl_days.get(precision)
        };
        now.saturating_sub(ttl_days.saturating_mul(MILLIS_PER_DAY)) <= request.range.start
    }

    fn limit_error(&self, request: &QueryRequest, series: SeriesCount, precision: Precision) -> PlanError {
        metrics::record_limit_exceeded(precision.as_str());
        PlanError::PrecisionLimitExceeded {
            metrics: series.metrics,
            hosts: series.hosts,
            precision,
            range_secs: request.range.duration_ms() / 1000,
            estimated: self.estimate(series, request.range, precision),
            limit: self.config.result_limit,
        }
    }

    fn choose_precision(
        &self,
        request: &QueryRequest,
        series: SeriesCount,
        now: Timestamp,
    ) -> Result<Precision, PlanError> {
        let limit = self.config.result_limit;

        if let Some(precision) = request.precision {
            if self.estimate(series, request.range, precision) > limit {
                return Err(self.limit_error(request, series, precision));
            }
            return Ok(precision);
        }

        Precision::LADDER
            .into_iter()
            .find(|p| {
                self.estimate(series, request.range, *p) <= limit && self.ttl_covers(request, *p, now)
            })
            .ok_or_else(|| self.limit_error(request, series, Precision::Days))
    }

    fn resolve(&self, request: &QueryRequest) -> Result<Vec<RowKey>, PlanError> {
        if request.metric_names.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.cache.resolve_keys(
            &request.metric_names,
            &request.host_names,
            request.app_id.as_deref(),
            request.instance_id.as_deref(),
        )?)
    }

    fn series_filter(&self, request: &QueryRequest, keys: Vec<RowKey>) -> SeriesFilter {
        if request.metric_names.is_empty() && request.host_names.is_empty() {
            return SeriesFilter::NoFilter;
        }

        if keys.is_empty() || keys.len() > self.config.max_in_clause_keys {
            tracing::debug!(
                resolved = keys.len(),
                max = self.config.max_in_clause_keys,
                "Using name patterns instead of key set"
            );
            SeriesFilter::Pattern(PatternFilter {
                metric_names: request.metric_names.clone(),
                host_names: request.host_names.clone(),
                app_id: request.app_id.clone(),
                instance_id: request.instance_id.clone(),
            })
        } else {
            SeriesFilter::ExactSet(keys)
        }
    }
}

/// How many series a request reads: the requested names, or what their
/// wildcards matched when that is more
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SeriesCount {
    metrics: usize,
    hosts: usize,
    total: u64,
}

impl SeriesCount {
    fn of(request: &QueryRequest, keys: &[RowKey]) -> Self {
        let metrics = request.metric_names.len();
        let hosts = request.host_names.len().max(1);
        let named = Self {
            metrics,
            hosts,
            total: (metrics as u64).saturating_mul(hosts as u64),
        };
        if keys.len() as u64 <= named.total {
            return named;
        }

        let mut metric_keys = HashSet::new();
        let mut host_keys = HashSet::new();
        for key in keys {
            match key {
                RowKey::Series(k) => {
                    metric_keys.insert(k.metric_key());
                    host_keys.insert(k.host_key());
                },
                RowKey::Metric(k) => {
                    metric_keys.insert(*k);
                },
            }
        }
        Self {
            metrics: metric_keys.len().max(metrics),
            hosts: host_keys.len().max(hosts),
            total: keys.len() as u64,
        }
    }
}
