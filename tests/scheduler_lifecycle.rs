//! Scheduler lifecycle: every level under one service manager, with
//! checkpoints persisted to disk across restarts.

use std::sync::Arc;
use std::time::Duration;

use kuba_rollup::config::AggregatorsConfig;
use kuba_rollup::metadata::SeriesIdentityCache;
use kuba_rollup::services::{
    build_rollup_services, register_rollup_services, CheckpointStore, CycleOutcome,
    FileCheckpointStore, LevelKind, ServiceConfig, ServiceManager, ServiceStatus, RollupStores,
};
use kuba_rollup::storage::InMemoryStore;
use tempfile::TempDir;

fn stores(dir: &TempDir, store: Arc<InMemoryStore>) -> RollupStores {
    RollupStores::in_memory(
        store,
        Arc::new(FileCheckpointStore::new(dir.path())),
        Arc::new(SeriesIdentityCache::in_memory()),
    )
}

#[tokio::test]
async fn test_manager_runs_and_stops_every_level() {
    let dir = TempDir::new().unwrap();
    let mut config = AggregatorsConfig::default();
    config.cluster_daily.disabled = true;

    let services = build_rollup_services(&config, &stores(&dir, Arc::new(InMemoryStore::new()))).unwrap();
    let manager = ServiceManager::new(ServiceConfig {
        shutdown_timeout: Duration::from_secs(5),
    });
    register_rollup_services(&manager, &services).unwrap();

    manager.start_all().await.unwrap();
    assert!(manager.start_all().await.is_err());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = manager.status();
    assert_eq!(status.len(), 7);
    assert!(status.values().all(|s| *s == ServiceStatus::Running));
    assert!(manager.is_healthy());
    assert!(manager.service_uptime("host-minute").is_some());

    manager.shutdown().await.unwrap();
    assert!(manager
        .status()
        .values()
        .all(|s| *s == ServiceStatus::Stopped));

    // The first tick of each enabled level initialized its checkpoint
    let reopened = FileCheckpointStore::new(dir.path());
    for kind in LevelKind::ALL {
        let checkpoint = reopened.read_checkpoint(kind.checkpoint_key()).await.unwrap();
        if kind == LevelKind::ClusterDaily {
            assert_eq!(checkpoint, None);
        } else {
            assert!(checkpoint.is_some(), "{} has no checkpoint", kind.name());
        }
    }
}

#[tokio::test]
async fn test_restart_resumes_from_persisted_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = AggregatorsConfig::default();

    let first = build_rollup_services(&config, &stores(&dir, Arc::new(InMemoryStore::new()))).unwrap();
    let minute = first
        .iter()
        .find(|s| s.level().name == "host-minute")
        .unwrap()
        .clone();
    let started = 1_700_000_040_000;
    assert_eq!(
        minute.run_once(started).await.outcome,
        CycleOutcome::Initialized { checkpoint: started }
    );
    drop(first);

    // A fresh process reads the checkpoint back and picks up the next window
    let restarted =
        build_rollup_services(&config, &stores(&dir, Arc::new(InMemoryStore::new()))).unwrap();
    let minute = restarted
        .iter()
        .find(|s| s.level().name == "host-minute")
        .unwrap();
    let interval = minute.level().interval_ms();
    match minute.run_once(started + interval).await.outcome {
        CycleOutcome::Aggregated { window, summary } => {
            assert_eq!(window.start, started);
            assert_eq!(window.end, started + interval);
            assert_eq!(summary.rows_written, 0);
        },
        other => panic!("unexpected outcome {:?}", other),
    }

    let reopened = FileCheckpointStore::new(dir.path());
    assert_eq!(
        reopened
            .read_checkpoint(LevelKind::HostMinute.checkpoint_key())
            .await
            .unwrap(),
        Some(started + interval)
    );
}

#[tokio::test]
async fn test_failing_level_does_not_stop_others() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let services = build_rollup_services(&AggregatorsConfig::default(), &stores(&dir, store.clone())).unwrap();
    let now = 1_700_000_040_000;

    for service in &services {
        service.run_once(now).await;
    }

    // Every read fails for one cycle of each level
    store.fail_next_reads(services.len());
    for service in &services {
        let interval = service.level().interval_ms();
        let report = service.run_once(now + interval).await;
        assert!(
            matches!(report.outcome, CycleOutcome::Failed { .. }),
            "{} did not fail",
            service.level().name
        );
        assert_eq!(report.sleep, service.level().interval);
    }

    for service in &services {
        let interval = service.level().interval_ms();
        let report = service.run_once(now + interval).await;
        assert!(matches!(report.outcome, CycleOutcome::Aggregated { .. }));
        let stats = service.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.windows_aggregated, 1);
        assert_eq!(stats.last_checkpoint, Some(now + interval));
    }
}
