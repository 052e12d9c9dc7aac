//! Destination seam for flushed batches.

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::{Result, SessionBatch};
use std::sync::Arc;
use store::SessionStore;

/// Applies a drained run of batches atomically.
///
/// The store is the production implementation; [`MemorySink`] backs tests
/// and database-free development.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn apply(&self, batches: &[SessionBatch]) -> Result<()>;
}

#[async_trait]
impl BatchSink for SessionStore {
    async fn apply(&self, batches: &[SessionBatch]) -> Result<()> {
        store::insert::apply_batches(self, batches).await
    }
}

/// In-memory sink that captures applied batches.
#[derive(Clone, Default)]
pub struct MemorySink {
    applied: Arc<Mutex<Vec<SessionBatch>>>,
    should_fail: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All batches applied through this sink, in application order.
    pub fn applied(&self) -> Vec<SessionBatch> {
        self.applied.lock().clone()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().len()
    }

    /// Simulate store failures.
    pub fn set_should_fail(&self, fail: bool) {
        *self.should_fail.lock() = fail;
    }
}

#[async_trait]
impl BatchSink for MemorySink {
    async fn apply(&self, batches: &[SessionBatch]) -> Result<()> {
        if *self.should_fail.lock() {
            return Err(relay_core::Error::database("memory sink failure"));
        }
        self.applied.lock().extend_from_slice(batches);
        Ok(())
    }
}
