//! Application state shared across handlers.

use broker::{ConnectionHub, SessionRegistry};
use std::sync::Arc;
use std::time::Instant;
use store::SessionStore;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Connection hub; owns WebSocket client state
    pub hub: Arc<ConnectionHub>,
    /// Live session registry
    pub registry: Arc<SessionRegistry>,
    /// Durable store
    pub store: SessionStore,
    /// Process start, for uptime reporting
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        hub: Arc<ConnectionHub>,
        registry: Arc<SessionRegistry>,
        store: SessionStore,
    ) -> Self {
        Self {
            hub,
            registry,
            store,
            started_at: Instant::now(),
        }
    }

    /// Seconds since the relay started.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
