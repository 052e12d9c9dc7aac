//! Row models for store queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A session row joined with its event and error counts.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: String,
    pub metadata: Value,
    pub is_active: bool,
    pub event_count: i64,
    pub error_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate totals across the store.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_sessions: i64,
    pub active_sessions: i64,
    pub total_events: i64,
}

/// One page of a session's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<Value>,
    /// Length of the full persisted stream, regardless of the slice returned.
    pub total: usize,
}
