//! Worker scheduler for background tasks.

use broker::SessionRegistry;
use relay_core::WorkerConfig;
use std::sync::Arc;
use std::time::Duration;
use store::SessionStore;
use tokio::time::interval;
use tracing::info;

use crate::cleanup::CleanupWorker;

/// Background worker scheduler.
pub struct WorkerScheduler {
    config: WorkerConfig,
    registry: Arc<SessionRegistry>,
    store: SessionStore,
}

impl WorkerScheduler {
    pub fn new(config: WorkerConfig, registry: Arc<SessionRegistry>, store: SessionStore) -> Self {
        Self {
            config,
            registry,
            store,
        }
    }

    /// Starts all background workers.
    pub fn start(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let scheduler = self.clone();
        handles.push(tokio::spawn(async move {
            scheduler.run_cleanup_worker().await;
        }));

        info!("Background workers started");
        handles
    }

    async fn run_cleanup_worker(&self) {
        let worker = CleanupWorker::new(
            self.registry.clone(),
            self.store.clone(),
            self.config.retention_hours,
        );
        let mut ticker = interval(Duration::from_millis(self.config.cleanup_interval_ms));
        // The first tick resolves immediately; skip it so startup is quiet.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            worker.run().await;
        }
    }
}
