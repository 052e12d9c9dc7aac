//! Live session state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A recording session owned by one tracker connection.
///
/// Events and errors are opaque JSON; the relay preserves arrival order and
/// never inspects payload internals. The in-memory event buffer is bounded:
/// [`Session::append_events`] trims the oldest half once the cap is crossed,
/// while `total_events` keeps counting the full stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    /// Opaque metadata snapshot from the tracker (url, userAgent, viewport, …).
    pub metadata: Value,
    pub is_active: bool,
    pub events: Vec<Value>,
    pub errors: Vec<Value>,
    /// Count of every event ever appended; unaffected by buffer trimming.
    pub total_events: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// Creates a new active session.
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>, metadata: Value) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            metadata,
            is_active: true,
            events: Vec::new(),
            errors: Vec::new(),
            total_events: 0,
            created_at: now,
            last_activity: now,
        }
    }

    /// Appends events in arrival order and enforces the buffer cap.
    ///
    /// When the buffer grows past `max_buffer`, only the most recent
    /// `max_buffer / 2` events are retained. Returns how many events were
    /// discarded from the head.
    pub fn append_events(&mut self, events: &[Value], max_buffer: usize) -> usize {
        self.events.extend_from_slice(events);
        self.total_events += events.len() as u64;
        self.last_activity = Utc::now();

        if self.events.len() > max_buffer {
            let keep = max_buffer / 2;
            let discard = self.events.len() - keep;
            self.events.drain(..discard);
            discard
        } else {
            0
        }
    }

    /// Records an error payload.
    pub fn record_error(&mut self, error: Value) {
        self.errors.push(error);
        self.last_activity = Utc::now();
    }

    /// Refreshes `last_activity` without touching the event stream.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Marks the session inactive. Terminal for live broadcast.
    pub fn end(&mut self) {
        self.is_active = false;
        self.last_activity = Utc::now();
    }

    /// Re-activates an ended session under a fresh metadata snapshot.
    pub fn reactivate(&mut self, user_id: impl Into<String>, metadata: Value) {
        self.user_id = user_id.into();
        self.metadata = metadata;
        self.is_active = true;
        self.last_activity = Utc::now();
    }

    /// True when the session has been idle longer than `age`.
    pub fn idle_longer_than(&self, age: Duration) -> bool {
        Utc::now() - self.last_activity > age
    }

    /// Summary view for wire snapshots and listings.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            metadata: self.metadata.clone(),
            is_active: self.is_active,
            event_count: self.total_events,
            error_count: self.errors.len() as u64,
            last_activity: self.last_activity,
        }
    }
}

/// Summary of a session for `active_sessions` snapshots and join replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub metadata: Value,
    pub is_active: bool,
    pub event_count: u64,
    pub error_count: u64,
    pub last_activity: DateTime<Utc>,
}
