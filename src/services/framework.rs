//! Service Framework
//!
//! Long-running background tasks (one per rollup level) behind a common
//! [`Service`] trait, and a [`ServiceManager`] that spawns them, reports their
//! status and stops them through a shared broadcast channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// Service Trait
// ============================================================================

/// A background task driven until shutdown
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Run the service until `shutdown` fires
    ///
    /// Work in flight when the signal arrives is finished; nothing new starts.
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError>;

    /// Unique name used for registration and logging
    fn name(&self) -> &'static str;

    /// Current status
    fn status(&self) -> ServiceStatus;
}

// ============================================================================
// Service Status
// ============================================================================

/// Status of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Main loop active
    Running,

    /// Not started yet, or main loop exited
    Stopped,
}

impl ServiceStatus {
    /// Whether the service is running
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceStatus::Running)
    }
}

// ============================================================================
// Service Error
// ============================================================================

/// Errors raised by the service framework
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// A service with the same name is already registered
    #[error("Service already registered: {0}")]
    AlreadyRegistered(String),

    /// The manager is already running its services
    #[error("Services already running")]
    AlreadyRunning,

    /// No service with that name
    #[error("Service not found: {0}")]
    NotFound(String),
}

// ============================================================================
// Service Config
// ============================================================================

/// Configuration for the service manager
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How long `shutdown` waits for services to finish in-flight work
    pub shutdown_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Service Manager
// ============================================================================

struct ServiceHandle {
    service: Arc<dyn Service>,
    task: Option<JoinHandle<Result<(), ServiceError>>>,
    started_at: Option<Instant>,
}

/// Spawns registered services and coordinates their shutdown
///
/// Services are independent of each other: each runs on its own tokio task
/// and a slow or failing one never blocks the rest.
pub struct ServiceManager {
    config: ServiceConfig,
    services: RwLock<BTreeMap<&'static str, ServiceHandle>>,
    shutdown_tx: broadcast::Sender<()>,
    running: RwLock<bool>,
}

impl ServiceManager {
    /// Create a new service manager
    pub fn new(config: ServiceConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            services: RwLock::new(BTreeMap::new()),
            shutdown_tx,
            running: RwLock::new(false),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ServiceConfig::default())
    }

    /// Register a service
    pub fn register(&self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let name = service.name();
        let mut services = self.services.write();
        if services.contains_key(name) {
            return Err(ServiceError::AlreadyRegistered(name.to_string()));
        }
        services.insert(
            name,
            ServiceHandle {
                service,
                task: None,
                started_at: None,
            },
        );
        tracing::debug!(service = name, "Service registered");
        Ok(())
    }

    /// Spawn every registered service
    pub async fn start_all(&self) -> Result<(), ServiceError> {
        {
            let mut running = self.running.write();
            if *running {
                return Err(ServiceError::AlreadyRunning);
            }
            *running = true;
        }

        let names: Vec<&'static str> = self.services.read().keys().copied().collect();
        for name in names {
            self.start_service(name)?;
        }

        tracing::info!(services = self.services.read().len(), "All services started");
        Ok(())
    }

    /// Spawn one registered service
    pub fn start_service(&self, name: &'static str) -> Result<(), ServiceError> {
        let mut services = self.services.write();
        let handle = services
            .get_mut(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;

        if handle.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(ServiceError::AlreadyRunning);
        }

        let service = handle.service.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        handle.task = Some(tokio::spawn(async move { service.start(shutdown_rx).await }));
        handle.started_at = Some(Instant::now());

        tracing::debug!(service = name, "Service started");
        Ok(())
    }

    /// Signal shutdown and wait for every service to exit
    ///
    /// Services still busy after the shutdown timeout are abandoned with a
    /// warning.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        tracing::info!("Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<(&'static str, JoinHandle<Result<(), ServiceError>>)> = {
            let mut services = self.services.write();
            services
                .iter_mut()
                .filter_map(|(name, handle)| handle.task.take().map(|task| (*name, task)))
                .collect()
        };

        let timeout = self.config.shutdown_timeout;
        let results = join_all(
            tasks
                .into_iter()
                .map(|(name, task)| async move { (name, tokio::time::timeout(timeout, task).await) }),
        )
        .await;

        for (name, result) in results {
            match result {
                Ok(Ok(Ok(()))) => tracing::debug!(service = name, "Service stopped"),
                Ok(Ok(Err(e))) => {
                    tracing::warn!(service = name, error = %e, "Service stopped with error")
                },
                Ok(Err(e)) => tracing::error!(service = name, error = %e, "Service task panicked"),
                Err(_) => tracing::warn!(service = name, "Service shutdown timed out"),
            }
        }

        *self.running.write() = false;
        tracing::info!("Shutdown complete");
        Ok(())
    }

    /// Status of every service, by name
    pub fn status(&self) -> BTreeMap<&'static str, ServiceStatus> {
        self.services
            .read()
            .iter()
            .map(|(name, handle)| (*name, handle.service.status()))
            .collect()
    }

    /// Status of one service
    pub fn service_status(&self, name: &str) -> Option<ServiceStatus> {
        self.services.read().get(name).map(|h| h.service.status())
    }

    /// Time since a service was spawned
    pub fn service_uptime(&self, name: &str) -> Option<Duration> {
        self.services
            .read()
            .get(name)
            .and_then(|h| h.started_at.map(|t| t.elapsed()))
    }

    /// Whether every service is running
    pub fn is_healthy(&self) -> bool {
        self.services
            .read()
            .values()
            .all(|h| h.service.status().is_healthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct IdleService {
        name: &'static str,
        status: RwLock<ServiceStatus>,
        stopped: AtomicBool,
    }

    impl IdleService {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                status: RwLock::new(ServiceStatus::Stopped),
                stopped: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl Service for IdleService {
        async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
            *self.status.write() = ServiceStatus::Running;
            let _ = shutdown.recv().await;
            *self.status.write() = ServiceStatus::Stopped;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            self.name
        }

        fn status(&self) -> ServiceStatus {
            self.status.read().clone()
        }
    }

    #[tokio::test]
    async fn test_manager_lifecycle() {
        let manager = ServiceManager::with_defaults();
        let a = Arc::new(IdleService::new("a"));
        let b = Arc::new(IdleService::new("b"));
        manager.register(a.clone()).unwrap();
        manager.register(b.clone()).unwrap();

        manager.start_all().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.is_healthy());
        assert!(manager.service_uptime("a").is_some());
        assert!(matches!(manager.start_all().await, Err(ServiceError::AlreadyRunning)));

        manager.shutdown().await.unwrap();
        assert!(a.stopped.load(Ordering::SeqCst));
        assert!(b.stopped.load(Ordering::SeqCst));
        assert_eq!(manager.service_status("a"), Some(ServiceStatus::Stopped));
    }

    #[test]
    fn test_duplicate_registration() {
        let manager = ServiceManager::with_defaults();
        manager.register(Arc::new(IdleService::new("x"))).unwrap();
        let result = manager.register(Arc::new(IdleService::new("x")));
        assert!(matches!(result, Err(ServiceError::AlreadyRegistered(_))));
        assert_eq!(manager.status().len(), 1);
    }

    #[tokio::test]
    async fn test_start_unknown_service() {
        let manager = ServiceManager::with_defaults();
        assert!(matches!(
            manager.start_service("missing"),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unstarted_service_is_unhealthy() {
        let manager = ServiceManager::with_defaults();
        manager.register(Arc::new(IdleService::new("idle"))).unwrap();
        assert_eq!(manager.service_status("idle"), Some(ServiceStatus::Stopped));
        assert!(!manager.is_healthy());
        assert!(manager.service_uptime("idle").is_none());
    }
}
