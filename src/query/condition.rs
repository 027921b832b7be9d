//! Query conditions
//!
//! A planned [`Condition`] names the table to read, the precision, and a
//! [`SeriesFilter`] that renders to a parameterized predicate. The filter is
//! one of a closed set of variants; illegal Top-N shapes never reach this
//! module because the planner classifies them first.
//!
//! | Variant        | Predicate                                                  |
//! |----------------|------------------------------------------------------------|
//! | `NoFilter`     | time range only                                            |
//! | `ExactSet`     | `(UUID IN (?, ...))` + time range                          |
//! | `Pattern`      | name / host / app / instance predicates + time range       |
//! | `TopNByHost`   | `UUID IN (SELECT ... ORDER BY <rank>, UUID LIMIT n)` + time|
//! | `TopNByMetric` | same, ranking metrics of one host                          |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::metadata::is_wildcard;
use crate::types::{Precision, RowKey, TimeRange};

const TIME_PREDICATE: &str = "SERVER_TIME >= ? AND SERVER_TIME < ?";

// ============================================================================
// Top-N
// ============================================================================

/// Aggregate used to rank series in a Top-N query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TopNFunction {
    /// Highest maximum
    Max,
    /// Lowest minimum
    Min,
    /// Mean of sums
    Avg,
    /// Total of sums
    Sum,
}

impl TopNFunction {
    /// SQL aggregate expression for the ranking
    pub fn sql(&self) -> &'static str {
        match self {
            TopNFunction::Max => "MAX(METRIC_MAX)",
            TopNFunction::Min => "MIN(METRIC_MIN)",
            TopNFunction::Avg => "AVG(METRIC_SUM)",
            TopNFunction::Sum => "SUM(METRIC_SUM)",
        }
    }
}

impl std::str::FromStr for TopNFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MAX" => Ok(TopNFunction::Max),
            "MIN" => Ok(TopNFunction::Min),
            "AVG" | "AVERAGE" => Ok(TopNFunction::Avg),
            "SUM" => Ok(TopNFunction::Sum),
            other => Err(format!("Unknown Top-N function '{}'", other)),
        }
    }
}

/// Top-N request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopNSpec {
    /// How many series to keep
    pub n: usize,
    /// Ranking aggregate
    pub function: TopNFunction,
    /// Keep the lowest ranked instead of the highest
    pub bottom: bool,
}

impl TopNSpec {
    /// Top `n` by `function`
    pub fn top(n: usize, function: TopNFunction) -> Self {
        Self {
            n,
            function,
            bottom: false,
        }
    }

    /// Bottom `n` by `function`
    pub fn bottom(n: usize, function: TopNFunction) -> Self {
        Self {
            n,
            function,
            bottom: true,
        }
    }

    fn order(&self) -> &'static str {
        if self.bottom {
            "ASC"
        } else {
            "DESC"
        }
    }
}

/// Which dimension a Top-N query ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopNKind {
    /// One metric, many hosts: rank hosts
    ByHost,
    /// One host, many metrics: rank metrics
    ByMetric,
}

impl TopNKind {
    /// Classify a metric/host combination, `None` when ambiguous
    ///
    /// Ranking hosts needs exactly one concrete metric and either several
    /// hosts or a host wildcard; ranking metrics is the mirror image.
    pub fn classify(metric_names: &[String], host_names: &[String]) -> Option<TopNKind> {
        let single_concrete = |names: &[String]| names.len() == 1 && !is_wildcard(&names[0]);
        let multi_valued = |names: &[String]| names.len() > 1 || names.iter().any(|n| is_wildcard(n));

        if single_concrete(metric_names) && multi_valued(host_names) {
            Some(TopNKind::ByHost)
        } else if single_concrete(host_names) && multi_valued(metric_names) {
            Some(TopNKind::ByMetric)
        } else {
            None
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Name based predicate used when keys cannot (or should not) be enumerated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternFilter {
    /// Metric names, exact or `%` patterns
    pub metric_names: Vec<String>,
    /// Host names, exact or `%` patterns
    pub host_names: Vec<String>,
    /// Exact app id
    pub app_id: Option<String>,
    /// Exact instance id
    pub instance_id: Option<String>,
}

/// One bound predicate parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryParam {
    /// Row key bytes
    Key(RowKey),
    /// Name or pattern
    Text(String),
    /// Epoch milliseconds
    Time(i64),
}

impl fmt::Display for QueryParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryParam::Key(k) => write!(f, "x'{}'", k),
            QueryParam::Text(s) => write!(f, "'{}'", s),
            QueryParam::Time(t) => write!(f, "{}", t),
        }
    }
}

/// Series restriction of a condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeriesFilter {
    /// Every series
    NoFilter,
    /// An enumerated, sorted key set
    ExactSet(Vec<RowKey>),
    /// Name predicates
    Pattern(PatternFilter),
    /// Rank hosts of one metric
    TopNByHost {
        /// Series the ranking runs over
        inner: Box<SeriesFilter>,
        /// Ranking
        spec: TopNSpec,
    },
    /// Rank metrics of one host
    TopNByMetric {
        /// Series the ranking runs over
        inner: Box<SeriesFilter>,
        /// Ranking
        spec: TopNSpec,
    },
}

impl SeriesFilter {
    /// Wrap `self` in a Top-N ranking of `kind`
    pub fn into_top_n(self, kind: TopNKind, spec: TopNSpec) -> SeriesFilter {
        let inner = Box::new(self);
        match kind {
            TopNKind::ByHost => SeriesFilter::TopNByHost { inner, spec },
            TopNKind::ByMetric => SeriesFilter::TopNByMetric { inner, spec },
        }
    }

    /// Whether this is a Top-N filter
    pub fn is_top_n(&self) -> bool {
        matches!(
            self,
            SeriesFilter::TopNByHost { .. } | SeriesFilter::TopNByMetric { .. }
        )
    }

    /// Series part of the predicate, without the time range
    fn series_clause(&self, params: &mut Vec<QueryParam>) -> Option<String> {
        match self {
            SeriesFilter::NoFilter => None,
            SeriesFilter::ExactSet(keys) => {
                params.extend(keys.iter().map(|k| QueryParam::Key(*k)));
                Some(format!("(UUID IN ({}))", placeholders(keys.len())))
            },
            SeriesFilter::Pattern(pattern) => pattern_clause(pattern, params),
            SeriesFilter::TopNByHost { inner, .. } | SeriesFilter::TopNByMetric { inner, .. } => {
                inner.series_clause(params)
            },
        }
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// `(NAME IN (?) OR NAME LIKE ?)` over the exact and wildcard names
fn names_clause(column: &str, names: &[String], params: &mut Vec<QueryParam>) -> Option<String> {
    let (patterns, exact): (Vec<&String>, Vec<&String>) =
        names.iter().partition(|n| is_wildcard(n));

    let mut parts = Vec::new();
    if !exact.is_empty() {
        if exact.len() == 1 {
            parts.push(format!("{} = ?", column));
        } else {
            parts.push(format!("{} IN ({})", column, placeholders(exact.len())));
        }
        params.extend(exact.into_iter().map(|n| QueryParam::Text(n.clone())));
    }
    for pattern in patterns {
        parts.push(format!("{} LIKE ?", column));
        params.push(QueryParam::Text(pattern.clone()));
    }

    match parts.len() {
        0 => None,
        1 => parts.pop(),
        _ => Some(format!("({})", parts.join(" OR "))),
    }
}

fn pattern_clause(pattern: &PatternFilter, params: &mut Vec<QueryParam>) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(metrics) = names_clause("METRIC_NAME", &pattern.metric_names, params) {
        parts.push(metrics);
    }
    if let Some(hosts) = names_clause("HOSTNAME", &pattern.host_names, params) {
        parts.push(hosts);
    }
    if let Some(app) = &pattern.app_id {
        parts.push("APP_ID = ?".to_string());
        params.push(QueryParam::Text(app.clone()));
    }
    if let Some(instance) = &pattern.instance_id {
        parts.push("INSTANCE_ID = ?".to_string());
        params.push(QueryParam::Text(instance.clone()));
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" AND "))
    }
}

// ============================================================================
// Condition
// ============================================================================

/// A planned query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    /// Chosen precision
    pub precision: Precision,
    /// Table to read
    pub table: &'static str,
    /// Series restriction
    pub filter: SeriesFilter,
    /// Requested window
    pub range: TimeRange,
    /// Row limit, if any
    pub limit: Option<usize>,
    /// Precision was explicit, so the result limit is not appended
    pub no_limit: bool,
    /// Rows are grouped per series
    pub grouped: bool,
    /// Estimated result size at the chosen precision
    pub estimated_points: u64,
}

impl Condition {
    /// Whether this condition reads a host table
    pub fn reads_host_table(&self) -> bool {
        self.table == self.precision.host_table()
    }

    /// Predicate text and its bound parameters, in placeholder order
    pub fn clause_with_params(&self) -> (String, Vec<QueryParam>) {
        let mut params = Vec::new();
        let time = |params: &mut Vec<QueryParam>| {
            params.push(QueryParam::Time(self.range.start));
            params.push(QueryParam::Time(self.range.end));
        };

        let clause = match &self.filter {
            SeriesFilter::TopNByHost { spec, .. } | SeriesFilter::TopNByMetric { spec, .. } => {
                let inner = self.filter.series_clause(&mut params);
                time(&mut params);
                let base = match inner {
                    Some(series) => format!("{} AND {}", series, TIME_PREDICATE),
                    None => TIME_PREDICATE.to_string(),
                };
                time(&mut params);
                format!(
                    " UUID IN (SELECT UUID FROM {} WHERE {} GROUP BY UUID ORDER BY {} {}, UUID ASC LIMIT {}) AND {}",
                    self.table,
                    base,
                    spec.function.sql(),
                    spec.order(),
                    spec.n,
                    TIME_PREDICATE
                )
            },
            filter => {
                let series = filter.series_clause(&mut params);
                time(&mut params);
                match series {
                    Some(series) => format!("{} AND {}", series, TIME_PREDICATE),
                    None => TIME_PREDICATE.to_string(),
                }
            },
        };
        (clause, params)
    }

    /// Predicate text
    pub fn clause(&self) -> String {
        self.clause_with_params().0
    }

    /// Bound parameters, in placeholder order
    pub fn params(&self) -> Vec<QueryParam> {
        self.clause_with_params().1
    }

    /// Full select statement over the target table
    pub fn statement(&self, result_limit: u64) -> String {
        let count_column = if !self.reads_host_table() && self.precision == Precision::Seconds {
            "HOSTS_COUNT"
        } else {
            "METRIC_COUNT"
        };
        let mut sql = format!(
            "SELECT UUID, SERVER_TIME, METRIC_SUM, {}, METRIC_MAX, METRIC_MIN FROM {} WHERE {}",
            count_column,
            self.table,
            self.clause().trim_start()
        );
        if self.grouped {
            sql.push_str(" ORDER BY UUID, SERVER_TIME");
        } else {
            sql.push_str(" ORDER BY SERVER_TIME");
        }

        match (self.limit, self.no_limit) {
            (Some(limit), _) => sql.push_str(&format!(" LIMIT {}", limit)),
            (None, false) => sql.push_str(&format!(" LIMIT {}", result_limit)),
            (None, true) => {},
        }
        sql
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.table, self.precision, self.clause().trim_start())
    }
}
