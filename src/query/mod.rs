//! Query condition planning
//!
//! Requests name metrics and hosts (optionally with `%` wildcards) over a
//! time window. The planner picks the precision whose table can answer within
//! the result limit, resolves names into row keys through the identity cache,
//! and renders a parameterized predicate for the storage layer.
//!
//! ```text
//! QueryRequest ──▶ QueryPlanner ──▶ PlanOutcome ──▶ Condition ──▶ clause + params
//!                     │
//!                     └── SeriesIdentityCache (name → key resolution)
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use kuba_rollup::metadata::SeriesIdentityCache;
//! use kuba_rollup::query::{QueryPlanner, QueryPlannerConfig, QueryRequest};
//! use kuba_rollup::types::Precision;
//!
//! let planner = QueryPlanner::new(
//!     Arc::new(SeriesIdentityCache::in_memory()),
//!     QueryPlannerConfig::default(),
//! );
//! let now = 1_700_000_000_000;
//! let request = QueryRequest::builder()
//!     .metrics(["cpu_user", "mem_free"])
//!     .host("host1")
//!     .start_time(now - 200_000)
//!     .end_time(now)
//!     .build()
//!     .unwrap();
//!
//! let outcome = planner.plan_at(&request, now).unwrap();
//! assert_eq!(outcome.condition().precision, Precision::Seconds);
//! ```

pub mod condition;
pub mod error;
pub mod planner;
pub mod topn;

pub use condition::{
    Condition, PatternFilter, QueryParam, SeriesFilter, TopNFunction, TopNKind, TopNSpec,
};
pub use error::PlanError;
pub use planner::{
    PerPrecision, PlanOutcome, QueryPlanner, QueryPlannerConfig, QueryRequest,
    QueryRequestBuilder,
};
pub use topn::rank_series;
