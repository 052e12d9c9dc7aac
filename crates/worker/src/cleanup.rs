//! Session cleanup: registry eviction plus store retention.

use broker::SessionRegistry;
use std::sync::Arc;
use store::SessionStore;
use tracing::{debug, info, warn};

/// Inactive sessions idle longer than this are dropped from memory.
/// Store-side retention is configured separately.
const MEMORY_RETENTION_HOURS: i64 = 24;

/// Worker that reclaims memory and enforces store retention.
pub struct CleanupWorker {
    registry: Arc<SessionRegistry>,
    store: SessionStore,
    retention_hours: i32,
}

impl CleanupWorker {
    pub fn new(registry: Arc<SessionRegistry>, store: SessionStore, retention_hours: i32) -> Self {
        Self {
            registry,
            store,
            retention_hours,
        }
    }

    /// One cleanup pass.
    pub async fn run(&self) {
        let evicted = self
            .registry
            .evict_stale(chrono::Duration::hours(MEMORY_RETENTION_HOURS));
        if evicted > 0 {
            info!(evicted = evicted, "Evicted stale sessions from memory");
        }

        match store::query::cleanup_old_sessions(&self.store, self.retention_hours).await {
            Ok(0) => debug!("No aged sessions to delete"),
            Ok(deleted) => info!(
                deleted = deleted,
                retention_hours = self.retention_hours,
                "Deleted aged sessions from store"
            ),
            Err(e) => warn!(error = %e, "Store cleanup failed"),
        }
    }
}
