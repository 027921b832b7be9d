//! Rollup Scheduler
//!
//! One periodic worker per rollup level. Each cycle runs
//!
//! ```text
//! Idle ──▶ ComputeWindow ──▶ DoWork ──▶ Persist ──▶ Idle
//!               │                │
//!               │ (init / skip)  └── failure: checkpoint untouched,
//!               └──▶ Persist          same window retried next cycle
//! ```
//!
//! The window comes from the level's persisted checkpoint (end of the last
//! aggregated window) and the current time:
//!
//! | lag = now − checkpoint          | decision                               |
//! |---------------------------------|----------------------------------------|
//! | no checkpoint                   | initialize checkpoint to `now`         |
//! | `lag <= interval`               | `[cp, cp + interval)` once it is over  |
//! | `lag <= cutoff × interval`      | `[cp, now − interval)` (catch up)      |
//! | beyond                          | skip the missed span, checkpoint `now` |
//!
//! Skipping trades completeness for a bounded catch-up cost; it is reported
//! as a lag event, never as an error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use super::checkpoint::CheckpointStore;
use super::framework::{Service, ServiceError, ServiceStatus};
use crate::aggregation::{RollupWork, WorkSummary};
use crate::metrics;
use crate::types::{TimeRange, Timestamp};

// ============================================================================
// Levels
// ============================================================================

/// The standard rollup levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LevelKind {
    /// Raw points into host minute rows
    HostMinute,
    /// Host minute rows into hourly rows
    HostHourly,
    /// Host hourly rows into daily rows
    HostDaily,
    /// Raw points into 30 second cluster slices
    ClusterSecond,
    /// Cluster second rows into minute rows
    ClusterMinute,
    /// Cluster minute rows into hourly rows
    ClusterHourly,
    /// Cluster hourly rows into daily rows
    ClusterDaily,
}

impl LevelKind {
    /// Every level, host levels first
    pub const ALL: [LevelKind; 7] = [
        LevelKind::HostMinute,
        LevelKind::HostHourly,
        LevelKind::HostDaily,
        LevelKind::ClusterSecond,
        LevelKind::ClusterMinute,
        LevelKind::ClusterHourly,
        LevelKind::ClusterDaily,
    ];

    /// Level name used in logs, metrics and service registration
    pub fn name(&self) -> &'static str {
        match self {
            LevelKind::HostMinute => "host-minute",
            LevelKind::HostHourly => "host-hourly",
            LevelKind::HostDaily => "host-daily",
            LevelKind::ClusterSecond => "cluster-second",
            LevelKind::ClusterMinute => "cluster-minute",
            LevelKind::ClusterHourly => "cluster-hourly",
            LevelKind::ClusterDaily => "cluster-daily",
        }
    }

    /// Name the checkpoint is stored under
    pub fn checkpoint_key(&self) -> &'static str {
        match self {
            LevelKind::HostMinute => "timeline-metrics-host-aggregator-checkpoint",
            LevelKind::HostHourly => "timeline-metrics-host-aggregator-hourly-checkpoint",
            LevelKind::HostDaily => "timeline-metrics-host-aggregator-daily-checkpoint",
            LevelKind::ClusterSecond => "timeline-metrics-cluster-aggregator-checkpoint",
            LevelKind::ClusterMinute => "timeline-metrics-cluster-aggregator-minute-checkpoint",
            LevelKind::ClusterHourly => "timeline-metrics-cluster-aggregator-hourly-checkpoint",
            LevelKind::ClusterDaily => "timeline-metrics-cluster-aggregator-daily-checkpoint",
        }
    }

    /// Default sleep interval
    pub fn default_interval(&self) -> Duration {
        let secs = match self {
            LevelKind::HostMinute => 300,
            LevelKind::HostHourly => 3_600,
            LevelKind::HostDaily => 86_400,
            LevelKind::ClusterSecond => 120,
            LevelKind::ClusterMinute => 300,
            LevelKind::ClusterHourly => 3_600,
            LevelKind::ClusterDaily => 86_400,
        };
        Duration::from_secs(secs)
    }

    /// Default cutoff multiplier
    pub fn default_cutoff(&self) -> u32 {
        match self {
            LevelKind::HostMinute => 3,
            LevelKind::HostDaily | LevelKind::ClusterDaily => 1,
            _ => 2,
        }
    }

    /// Level with default settings
    pub fn level(&self) -> RollupLevel {
        RollupLevel {
            name: self.name(),
            checkpoint_key: self.checkpoint_key(),
            interval: self.default_interval(),
            cutoff: self.default_cutoff(),
            disabled: false,
        }
    }
}

/// Schedule of one rollup level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupLevel {
    /// Level name
    pub name: &'static str,
    /// Checkpoint name
    pub checkpoint_key: &'static str,
    /// Sleep interval, also the nominal window width
    pub interval: Duration,
    /// How many intervals of lag are caught up before skipping
    pub cutoff: u32,
    /// Disabled levels do nothing
    pub disabled: bool,
}

impl RollupLevel {
    /// Interval in milliseconds
    pub fn interval_ms(&self) -> i64 {
        self.interval.as_millis() as i64
    }
}

/// All standard levels with default settings
pub fn standard_levels() -> Vec<RollupLevel> {
    LevelKind::ALL.iter().map(|k| k.level()).collect()
}

// ============================================================================
// Window computation
// ============================================================================

/// What a cycle should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// First run: persist `checkpoint`, aggregate nothing
    Initialize {
        /// New checkpoint
        checkpoint: Timestamp,
    },

    /// The next window is not over yet
    Wait,

    /// Aggregate `window`; its end becomes the checkpoint
    Aggregate {
        /// Window to aggregate
        window: TimeRange,
    },

    /// Too far behind: skip the missed span
    SkipLagging {
        /// New checkpoint (`now`)
        checkpoint: Timestamp,
        /// Lag that triggered the skip
        lag_ms: i64,
    },
}

/// Decide the next window of a level
pub fn compute_window(
    now: Timestamp,
    checkpoint: Option<Timestamp>,
    interval_ms: i64,
    cutoff: u32,
) -> WindowDecision {
    let Some(checkpoint) = checkpoint else {
        return WindowDecision::Initialize { checkpoint: now };
    };

    let lag = now - checkpoint;
    if lag <= interval_ms {
        let end = checkpoint + interval_ms;
        if now >= end {
            WindowDecision::Aggregate {
                window: TimeRange {
                    start: checkpoint,
                    end,
                },
            }
        } else {
            WindowDecision::Wait
        }
    } else if lag <= interval_ms.saturating_mul(i64::from(cutoff)) {
        WindowDecision::Aggregate {
            window: TimeRange {
                start: checkpoint,
                end: now - interval_ms,
            },
        }
    } else {
        WindowDecision::SkipLagging {
            checkpoint: now,
            lag_ms: lag,
        }
    }
}

// ============================================================================
// Cycle outcome
// ============================================================================

/// Result of one cycle
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Level disabled; nothing read or written
    Disabled,
    /// Checkpoint initialized
    Initialized {
        /// Persisted checkpoint
        checkpoint: Timestamp,
    },
    /// Window not over yet
    Waiting,
    /// Window aggregated and checkpoint advanced
    Aggregated {
        /// Aggregated window
        window: TimeRange,
        /// What the work step did
        summary: WorkSummary,
    },
    /// Missed span skipped and checkpoint moved to now
    SkippedLagging {
        /// Persisted checkpoint
        checkpoint: Timestamp,
        /// Lag that triggered the skip
        lag_ms: i64,
    },
    /// Cycle failed; checkpoint unchanged
    Failed {
        /// Window being processed, if one was computed
        window: Option<TimeRange>,
        /// Error message
        error: String,
    },
}

impl CycleOutcome {
    /// Label used for the cycle counter
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Disabled => "disabled",
            CycleOutcome::Initialized { .. } => "initialized",
            CycleOutcome::Waiting => "waiting",
            CycleOutcome::Aggregated { .. } => "aggregated",
            CycleOutcome::SkippedLagging { .. } => "skipped",
            CycleOutcome::Failed { .. } => "failed",
        }
    }
}

/// Outcome plus how long to sleep before the next cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// What happened
    pub outcome: CycleOutcome,
    /// Always the level's interval
    pub sleep: Duration,
}

/// Running totals of a level
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollupStats {
    /// Cycles run
    pub cycles: u64,
    /// Windows aggregated
    pub windows_aggregated: u64,
    /// Failed cycles
    pub failures: u64,
    /// Lag skips
    pub lag_events: u64,
    /// Rows written
    pub rows_written: u64,
    /// Last persisted checkpoint
    pub last_checkpoint: Option<Timestamp>,
}

// ============================================================================
// Rollup Service
// ============================================================================

/// Periodic worker driving one rollup level
pub struct RollupService {
    level: RollupLevel,
    work: Arc<dyn RollupWork>,
    checkpoints: Arc<dyn CheckpointStore>,
    status: RwLock<ServiceStatus>,
    stats: RwLock<RollupStats>,
}

impl RollupService {
    /// Create a worker for `level`
    pub fn new(
        level: RollupLevel,
        work: Arc<dyn RollupWork>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            level,
            work,
            checkpoints,
            status: RwLock::new(ServiceStatus::Stopped),
            stats: RwLock::new(RollupStats::default()),
        }
    }

    /// The level's schedule
    pub fn level(&self) -> &RollupLevel {
        &self.level
    }

    /// Get current statistics
    pub fn stats(&self) -> RollupStats {
        self.stats.read().clone()
    }

    /// Run one cycle as of `now`
    pub async fn run_once(&self, now: Timestamp) -> CycleReport {
        let started = Instant::now();
        let outcome = self.cycle(now).await;
        let name = self.level.name;

        metrics::record_cycle(name, outcome.label(), started.elapsed());
        {
            let mut stats = self.stats.write();
            stats.cycles += 1;
            match &outcome {
                CycleOutcome::Aggregated { window, summary } => {
                    stats.windows_aggregated += 1;
                    stats.rows_written += summary.rows_written as u64;
                    stats.last_checkpoint = Some(window.end);
                },
                CycleOutcome::Initialized { checkpoint } => {
                    stats.last_checkpoint = Some(*checkpoint);
                },
                CycleOutcome::SkippedLagging { checkpoint, .. } => {
                    stats.lag_events += 1;
                    stats.last_checkpoint = Some(*checkpoint);
                },
                CycleOutcome::Failed { .. } => stats.failures += 1,
                CycleOutcome::Disabled | CycleOutcome::Waiting => {},
            }
        }

        CycleReport {
            outcome,
            sleep: self.level.interval,
        }
    }

    async fn cycle(&self, now: Timestamp) -> CycleOutcome {
        let name = self.level.name;
        if self.level.disabled {
            tracing::debug!(level = name, "Level disabled, skipping cycle");
            return CycleOutcome::Disabled;
        }

        let checkpoint = match self.checkpoints.read_checkpoint(self.level.checkpoint_key).await {
            Ok(cp) => cp,
            Err(e) => return self.failed(None, e.to_string()),
        };

        match compute_window(now, checkpoint, self.level.interval_ms(), self.level.cutoff) {
            WindowDecision::Initialize { checkpoint } => {
                if let Err(e) = self.persist(checkpoint).await {
                    return self.failed(None, e);
                }
                tracing::info!(level = name, checkpoint, "Initialized checkpoint");
                CycleOutcome::Initialized { checkpoint }
            },
            WindowDecision::Wait => {
                tracing::debug!(level = name, now, "Window not complete, waiting");
                CycleOutcome::Waiting
            },
            WindowDecision::SkipLagging { checkpoint, lag_ms } => {
                tracing::warn!(
                    level = name,
                    lag_ms,
                    cutoff = self.level.cutoff,
                    "Aggregator lagging beyond cutoff, skipping missed span"
                );
                metrics::record_lag_event(name);
                if let Err(e) = self.persist(checkpoint).await {
                    return self.failed(None, e);
                }
                CycleOutcome::SkippedLagging { checkpoint, lag_ms }
            },
            WindowDecision::Aggregate { window } => {
                tracing::debug!(level = name, window = %window, "Aggregating window");
                let summary = match self.work.do_work(window).await {
                    Ok(summary) => summary,
                    Err(e) => return self.failed(Some(window), e.to_string()),
                };
                if let Err(e) = self.persist(window.end).await {
                    return self.failed(Some(window), e);
                }
                metrics::record_rows_written(name, summary.rows_written);
                CycleOutcome::Aggregated { window, summary }
            },
        }
    }

    async fn persist(&self, checkpoint: Timestamp) -> Result<(), String> {
        self.checkpoints
            .write_checkpoint(self.level.checkpoint_key, checkpoint)
            .await
            .map_err(|e| e.to_string())?;
        metrics::set_checkpoint(self.level.name, checkpoint);
        Ok(())
    }

    fn failed(&self, window: Option<TimeRange>, error: String) -> CycleOutcome {
        tracing::error!(
            level = self.level.name,
            window = ?window,
            error = %error,
            "Rollup cycle failed, window will be retried"
        );
        metrics::record_failure(self.level.name);
        CycleOutcome::Failed { window, error }
    }
}

/// Wall clock in epoch milliseconds
fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait::async_trait]
impl Service for RollupService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        tracing::debug!(
            level = self.level.name,
            interval_secs = self.level.interval.as_secs(),
            cutoff = self.level.cutoff,
            disabled = self.level.disabled,
            "Rollup level started"
        );

        let mut ticker = interval(self.level.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            tracing::debug!(level = self.level.name, "Rollup level received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(level = self.level.name, missed = n, "Shutdown receiver lagged");
                        }
                    }
                }

                _ = ticker.tick() => {
                    *self.status.write() = ServiceStatus::Running;
                    // The cycle runs to completion even if shutdown arrives meanwhile
                    self.run_once(now_millis()).await;
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::debug!(level = self.level.name, "Rollup level stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.level.name
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AggregationError, StorageError};
    use crate::services::checkpoint::InMemoryCheckpointStore;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const I: i64 = 30_000;

    /// Records every window it is asked to aggregate
    #[derive(Default)]
    struct RecordingWork {
        windows: Mutex<Vec<TimeRange>>,
        failures: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RollupWork for RecordingWork {
        async fn do_work(&self, window: TimeRange) -> Result<WorkSummary, AggregationError> {
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(StorageError::Timeout("read timed out".to_string()).into());
            }
            self.windows.lock().push(window);
            Ok(WorkSummary {
                rows_read: 1,
                rows_written: 1,
            })
        }
    }

    fn level(cutoff: u32) -> RollupLevel {
        RollupLevel {
            name: "test-level",
            checkpoint_key: "test-checkpoint",
            interval: Duration::from_millis(I as u64),
            cutoff,
            disabled: false,
        }
    }

    fn service(
        cutoff: u32,
    ) -> (RollupService, Arc<RecordingWork>, Arc<InMemoryCheckpointStore>) {
        let work = Arc::new(RecordingWork::default());
        let store = Arc::new(InMemoryCheckpointStore::new());
        let svc = RollupService::new(level(cutoff), work.clone(), store.clone());
        (svc, work, store)
    }

    #[test]
    fn test_compute_window_rules() {
        assert_eq!(
            compute_window(5, None, I, 2),
            WindowDecision::Initialize { checkpoint: 5 }
        );
        assert_eq!(compute_window(0, Some(0), I, 2), WindowDecision::Wait);
        assert_eq!(
            compute_window(I, Some(0), I, 2),
            WindowDecision::Aggregate {
                window: TimeRange { start: 0, end: I }
            }
        );

        let t = 1_000_000;
        assert_eq!(
            compute_window(t + 2 * I, Some(t), I, 2),
            WindowDecision::Aggregate {
                window: TimeRange {
                    start: t,
                    end: t + I
                }
            }
        );
        assert_eq!(
            compute_window(t + 3 * I, Some(t), I, 2),
            WindowDecision::SkipLagging {
                checkpoint: t + 3 * I,
                lag_ms: 3 * I
            }
        );
    }

    #[tokio::test]
    async fn test_wait_does_not_touch_checkpoint() {
        let (svc, work, store) = service(2);
        store.seed("test-checkpoint", 0);

        let report = svc.run_once(0).await;
        assert_eq!(report.outcome, CycleOutcome::Waiting);
        assert_eq!(report.sleep, Duration::from_millis(I as u64));
        assert_eq!(store.get("test-checkpoint"), Some(0));
        assert_eq!(store.write_count(), 0);
        assert!(work.windows.lock().is_empty());
    }

    #[tokio::test]
    async fn test_on_schedule_cycle() {
        let (svc, work, store) = service(2);
        store.seed("test-checkpoint", 0);

        let report = svc.run_once(I).await;
        assert!(matches!(report.outcome, CycleOutcome::Aggregated { .. }));
        assert_eq!(store.get("test-checkpoint"), Some(I));
        assert_eq!(*work.windows.lock(), vec![TimeRange { start: 0, end: I }]);
    }

    #[tokio::test]
    async fn test_initialize_then_aggregate() {
        let (svc, work, store) = service(2);

        let first = svc.run_once(10_000).await;
        assert_eq!(first.outcome, CycleOutcome::Initialized { checkpoint: 10_000 });
        assert!(work.windows.lock().is_empty());

        svc.run_once(10_000 + I).await;
        assert_eq!(store.get("test-checkpoint"), Some(10_000 + I));
        assert_eq!(svc.stats().windows_aggregated, 1);
    }

    #[tokio::test]
    async fn test_skip_when_lagging() {
        let (svc, work, store) = service(2);
        let t = 1_000_000;
        store.seed("test-checkpoint", t);

        let report = svc.run_once(t + 3 * I).await;
        assert!(matches!(report.outcome, CycleOutcome::SkippedLagging { .. }));
        assert_eq!(store.get("test-checkpoint"), Some(t + 3 * I));
        assert!(work.windows.lock().is_empty());
        assert_eq!(svc.stats().lag_events, 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_checkpoint_and_retries() {
        let (svc, work, store) = service(2);
        store.seed("test-checkpoint", 0);
        work.failures.store(1, Ordering::SeqCst);

        let report = svc.run_once(I).await;
        assert!(matches!(report.outcome, CycleOutcome::Failed { .. }));
        assert_eq!(store.get("test-checkpoint"), Some(0));

        // The same window is retried
        svc.run_once(I).await;
        assert_eq!(*work.windows.lock(), vec![TimeRange { start: 0, end: I }]);
        assert_eq!(store.get("test-checkpoint"), Some(I));
        assert_eq!(svc.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_write_failure_is_a_failed_cycle() {
        let (svc, _work, store) = service(2);
        store.seed("test-checkpoint", 0);
        store.fail_next_writes(1);

        let report = svc.run_once(I).await;
        assert!(matches!(report.outcome, CycleOutcome::Failed { window: Some(_), .. }));
        assert_eq!(store.get("test-checkpoint"), Some(0));
    }

    #[tokio::test]
    async fn test_disabled_level() {
        let work = Arc::new(RecordingWork::default());
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mut lvl = level(2);
        lvl.disabled = true;
        let svc = RollupService::new(lvl, work.clone(), store.clone());

        let report = svc.run_once(I * 10).await;
        assert_eq!(report.outcome, CycleOutcome::Disabled);
        assert_eq!(store.get("test-checkpoint"), None);
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn test_standard_levels() {
        let levels = standard_levels();
        assert_eq!(levels.len(), 7);
        let minute = &levels[0];
        assert_eq!(minute.name, "host-minute");
        assert_eq!(minute.interval, Duration::from_secs(300));
        assert_eq!(minute.cutoff, 3);
        let second = LevelKind::ClusterSecond.level();
        assert_eq!(second.interval, Duration::from_secs(120));
        assert_eq!(
            second.checkpoint_key,
            "timeline-metrics-cluster-aggregator-checkpoint"
        );
    }

    #[tokio::test]
    async fn test_service_stops_on_shutdown() {
        let (svc, _work, _store) = service(2);
        let svc = Arc::new(svc);
        let (tx, rx) = broadcast::channel(1);

        let runner = svc.clone();
        let handle = tokio::spawn(async move { runner.start(rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(svc.status(), ServiceStatus::Running);

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(svc.status(), ServiceStatus::Stopped);
        // The immediate first tick initialized the checkpoint
        assert!(svc.stats().last_checkpoint.is_some());
    }

    proptest! {
        #[test]
        fn prop_checkpoint_never_decreases(
            start in 0i64..1_000_000_000,
            steps in proptest::collection::vec(0i64..200_000, 1..30),
            cutoff in 1u32..4,
        ) {
            let mut checkpoint = Some(start);
            let mut now = start;
            for step in steps {
                now += step;
                let prev = checkpoint;
                match compute_window(now, checkpoint, I, cutoff) {
                    WindowDecision::Aggregate { window } => {
                        prop_assert!(window.start < window.end);
                        prop_assert!(window.end <= now);
                        checkpoint = Some(window.end);
                    }
                    WindowDecision::SkipLagging { checkpoint: cp, .. } => checkpoint = Some(cp),
                    WindowDecision::Initialize { checkpoint: cp } => checkpoint = Some(cp),
                    WindowDecision::Wait => {}
                }
                prop_assert!(checkpoint >= prev);
            }
        }
    }
}
