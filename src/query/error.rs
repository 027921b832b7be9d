//! Query planning errors

use crate::error::MetadataError;
use crate::types::{Precision, Timestamp};

/// Errors that can occur while planning a query
#[derive(Debug)]
pub enum PlanError {
    /// No metric names were requested
    EmptyMetricNames,

    /// Start/end missing on one side, or start after end
    InvalidTimeRange {
        /// Requested start
        start: Option<Timestamp>,
        /// Requested end
        end: Option<Timestamp>,
    },

    /// Requested row limit above the configured result limit
    LimitTooBig {
        /// Requested limit
        limit: usize,
        /// Maximum allowed
        max: u64,
    },

    /// Even the chosen (or coarsest) precision returns too many points
    PrecisionLimitExceeded {
        /// Number of metric names
        metrics: usize,
        /// Number of hosts (at least 1)
        hosts: usize,
        /// Precision the estimate was made for
        precision: Precision,
        /// Length of the time range in seconds
        range_secs: i64,
        /// Estimated result size
        estimated: u64,
        /// Configured result limit
        limit: u64,
    },

    /// Series names could not be resolved to keys
    Resolution(String),
}

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanError::EmptyMetricNames => write!(f, "No metric name filters specified"),
            PlanError::InvalidTimeRange { start, end } => write!(
                f,
                "Invalid time range: start {:?}, end {:?}. Both must be set and start must not be after end",
                start, end
            ),
            PlanError::LimitTooBig { limit, max } => write!(
                f,
                "Requested limit {} is greater than the result limit of {}",
                limit, max
            ),
            PlanError::PrecisionLimitExceeded {
                metrics,
                hosts,
                precision,
                range_secs,
                estimated,
                limit,
            } => write!(
                f,
                "Requested {} metrics for {} hosts in {} precision for the time range of {} seconds. \
                 Estimated resultset size of {} is greater than the limit of {}. \
                 Request lower precision or fewer number of metrics or hosts.",
                metrics, hosts, precision, range_secs, estimated, limit
            ),
            PlanError::Resolution(msg) => write!(f, "Series resolution failed: {}", msg),
        }
    }
}

impl std::error::Error for PlanError {}

impl From<MetadataError> for PlanError {
    fn from(e: MetadataError) -> Self {
        PlanError::Resolution(e.to_string())
    }
}
