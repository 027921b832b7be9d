//! Background Services Module
//!
//! Each rollup level runs as its own [`RollupService`] under a shared
//! [`ServiceManager`]:
//!
//! ```text
//! ┌──────────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │   host-minute    │   │   host-hourly    │   │    host-daily    │
//! └──────────────────┘   └──────────────────┘   └──────────────────┘
//! ┌──────────────────┐   ┌──────────────────┐   ┌──────────────────┐   ┌───────────────┐
//! │  cluster-second  │   │  cluster-minute  │   │  cluster-hourly  │   │ cluster-daily │
//! └──────────────────┘   └──────────────────┘   └──────────────────┘   └───────────────┘
//!          │                       all levels
//!          ▼
//!   CheckpointStore (one checkpoint per level)
//! ```
//!
//! Levels never wait on each other. A coarser level reads whatever the finer
//! one has written so far.
//!
//! # Example
//!
//! ```rust
//! use kuba_rollup::services::{ServiceConfig, ServiceManager};
//!
//! let manager = ServiceManager::new(ServiceConfig::default());
//! assert_eq!(manager.status().len(), 0);
//! ```

pub mod checkpoint;
pub mod framework;
pub mod rollup;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
pub use framework::{Service, ServiceConfig, ServiceError, ServiceManager, ServiceStatus};
pub use rollup::{
    compute_window, standard_levels, CycleOutcome, CycleReport, LevelKind, RollupLevel,
    RollupService, RollupStats, WindowDecision,
};

use std::sync::Arc;

use crate::aggregation::{ClusterSecondAggregator, ClusterTimeRollup, HostRollup, RollupWork};
use crate::config::AggregatorsConfig;
use crate::error::AggregationError;
use crate::metadata::SeriesIdentityCache;
use crate::storage::{AggregateReader, AggregateWriter, InMemoryStore, RawPointReader};
use crate::types::Precision;

/// Collaborators shared by every level
#[derive(Clone)]
pub struct RollupStores {
    /// Raw point source
    pub raw: Arc<dyn RawPointReader>,
    /// Aggregate table reader
    pub aggregates: Arc<dyn AggregateReader>,
    /// Aggregate table writer
    pub writer: Arc<dyn AggregateWriter>,
    /// Level checkpoints
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Series identities for cluster regrouping
    pub cache: Arc<SeriesIdentityCache>,
}

impl RollupStores {
    /// Every table served by one in-memory store
    pub fn in_memory(
        store: Arc<InMemoryStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        cache: Arc<SeriesIdentityCache>,
    ) -> Self {
        Self {
            raw: store.clone(),
            aggregates: store.clone(),
            writer: store,
            checkpoints,
            cache,
        }
    }
}

/// The aggregation step behind `kind`
pub fn level_work(
    kind: LevelKind,
    config: &AggregatorsConfig,
    stores: &RollupStores,
) -> Result<Arc<dyn RollupWork>, AggregationError> {
    let threshold = config.parallel_threshold;
    let work: Arc<dyn RollupWork> = match kind {
        LevelKind::HostMinute => Arc::new(
            HostRollup::minute(stores.raw.clone(), stores.writer.clone())
                .with_parallel_threshold(threshold),
        ),
        LevelKind::HostHourly | LevelKind::HostDaily => {
            let target = if kind == LevelKind::HostHourly {
                Precision::Hours
            } else {
                Precision::Days
            };
            Arc::new(
                HostRollup::from_finer(stores.aggregates.clone(), stores.writer.clone(), target)?
                    .with_parallel_threshold(threshold),
            )
        },
        LevelKind::ClusterSecond => Arc::new(ClusterSecondAggregator::new(
            stores.raw.clone(),
            stores.writer.clone(),
            stores.cache.clone(),
            config.cluster(),
        )?),
        LevelKind::ClusterMinute | LevelKind::ClusterHourly | LevelKind::ClusterDaily => {
            let target = match kind {
                LevelKind::ClusterMinute => Precision::Minutes,
                LevelKind::ClusterHourly => Precision::Hours,
                _ => Precision::Days,
            };
            Arc::new(
                ClusterTimeRollup::new(stores.aggregates.clone(), stores.writer.clone(), target)?
                    .with_parallel_threshold(threshold),
            )
        },
    };
    Ok(work)
}

/// One service per standard level, configured from `config`
///
/// Disabled levels are included; they idle without touching their checkpoint.
pub fn build_rollup_services(
    config: &AggregatorsConfig,
    stores: &RollupStores,
) -> Result<Vec<Arc<RollupService>>, AggregationError> {
    LevelKind::ALL
        .iter()
        .map(|kind| {
            let work = level_work(*kind, config, stores)?;
            Ok(Arc::new(RollupService::new(
                config.level(*kind),
                work,
                stores.checkpoints.clone(),
            )))
        })
        .collect()
}

/// Register rollup services with `manager`
pub fn register_rollup_services(
    manager: &ServiceManager,
    services: &[Arc<RollupService>],
) -> Result<(), ServiceError> {
    for service in services {
        manager.register(service.clone())?;
    }
    Ok(())
}
