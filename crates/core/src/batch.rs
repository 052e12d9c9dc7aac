//! Coalesced persistence units handed to the write-behind batcher.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::Session;

/// A single-session write unit: session metadata upsert plus optional
/// event and error appends, applied atomically in one store transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBatch {
    pub session_id: String,
    pub user_id: String,
    pub metadata: Value,
    pub is_active: bool,
    pub events: Vec<Value>,
    pub errors: Vec<Value>,
}

impl SessionBatch {
    /// A metadata-only snapshot of the session's current state.
    pub fn snapshot(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            user_id: session.user_id.clone(),
            metadata: session.metadata.clone(),
            is_active: session.is_active,
            events: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Attaches newly appended events to the batch.
    pub fn with_events(mut self, events: Vec<Value>) -> Self {
        self.events = events;
        self
    }

    /// Attaches newly recorded errors to the batch.
    pub fn with_errors(mut self, errors: Vec<Value>) -> Self {
        self.errors = errors;
        self
    }
}
