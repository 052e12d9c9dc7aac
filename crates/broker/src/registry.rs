//! In-memory session registry.
//!
//! Single logical owner of live session mutation. The map lock is held
//! briefly to find or insert a session cell; per-session mutexes guard the
//! actual mutations. Observer notifications and batch enqueues happen after
//! every lock has been released; the enqueue is awaited so batcher
//! backpressure reaches the producing connection.

use batcher::Batcher;
use chrono::{Duration, Utc};
use parking_lot::{Mutex, RwLock};
use relay_core::{Error, Result, Session, SessionBatch, SessionSnapshot};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use telemetry::metrics;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Domain-event subscriber. The connection hub implements this to translate
/// registry lifecycle into wire broadcasts; the registry never learns about
/// connections.
pub trait SessionObserver: Send + Sync {
    fn session_started(&self, session_id: &str, user_id: &str, metadata: &Value);
    fn session_ended(&self, session_id: &str);
    fn events_added(&self, session_id: &str, events: &[Value]);
    /// `kind` is the original wire type (`error`, `javascript_error`,
    /// `promise_rejection`) so fan-out can preserve it.
    fn error_added(&self, session_id: &str, kind: &str, error: &Value);
}

/// A slice of a session's in-memory buffer.
pub struct MemoryPage {
    pub events: Vec<Value>,
    pub total_events: u64,
    /// True while the buffer still holds the entire stream, i.e. no trim has
    /// happened. Once false, buffer indexes no longer equal stream indexes
    /// and historical reads must go through the store.
    pub buffer_complete: bool,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
    batcher: Arc<Batcher>,
    max_events_per_session: usize,
}

impl SessionRegistry {
    pub fn new(batcher: Arc<Batcher>, max_events_per_session: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            batcher,
            max_events_per_session,
        }
    }

    /// Registers a lifecycle subscriber.
    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.write().push(observer);
    }

    fn observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        self.observers.read().clone()
    }

    fn cell(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Creates a session, or re-activates an existing one under a fresh
    /// metadata snapshot. Id-conflict rejection happens in the hub, which
    /// knows which connection owns what; by the time this runs the id is
    /// settled.
    pub async fn start_session(
        &self,
        session_id: &str,
        user_id: &str,
        metadata: Value,
    ) -> SessionSnapshot {
        let cell = {
            let mut map = self.sessions.write();
            if let Some(cell) = map.get(session_id) {
                let cell = cell.clone();
                cell.lock().reactivate(user_id, metadata);
                cell
            } else {
                let cell = Arc::new(Mutex::new(Session::new(session_id, user_id, metadata)));
                map.insert(session_id.to_string(), cell.clone());
                cell
            }
        };

        let (snapshot, batch) = {
            let session = cell.lock();
            (session.snapshot(), SessionBatch::snapshot(&session))
        };

        metrics().sessions_started.inc();
        metrics().active_sessions.set(self.active_count() as u64);
        info!(session_id = session_id, user_id = user_id, "Session started");

        for observer in self.observers() {
            observer.session_started(session_id, &snapshot.user_id, &snapshot.metadata);
        }
        self.batcher.enqueue(batch).await;
        snapshot
    }

    /// Appends events in arrival order. Requires an active session.
    pub async fn append_events(&self, session_id: &str, events: Vec<Value>) -> Result<()> {
        let cell = self
            .cell(session_id)
            .ok_or_else(|| Error::routing(format!("unknown session: {session_id}")))?;

        let batch = {
            let mut session = cell.lock();
            if !session.is_active {
                return Err(Error::session_inactive(session_id));
            }

            let discarded = session.append_events(&events, self.max_events_per_session);
            if discarded > 0 {
                warn!(
                    session_id = session_id,
                    discarded = discarded,
                    buffered = session.events.len(),
                    "Event buffer over cap, trimmed oldest events"
                );
            }

            SessionBatch::snapshot(&session).with_events(events.clone())
        };

        metrics().events_received.inc_by(events.len() as u64);
        for observer in self.observers() {
            observer.events_added(session_id, &events);
        }
        self.batcher.enqueue(batch).await;
        Ok(())
    }

    /// Records an error payload. Errors are accepted even after the session
    /// has ended; only the event stream is terminal.
    pub async fn record_error(&self, session_id: &str, kind: &str, error: Value) -> Result<()> {
        let cell = self
            .cell(session_id)
            .ok_or_else(|| Error::routing(format!("unknown session: {session_id}")))?;

        let batch = {
            let mut session = cell.lock();
            session.record_error(error.clone());
            SessionBatch::snapshot(&session).with_errors(vec![error.clone()])
        };

        metrics().errors_recorded.inc();
        for observer in self.observers() {
            observer.error_added(session_id, kind, &error);
        }
        self.batcher.enqueue(batch).await;
        Ok(())
    }

    /// Marks a session inactive. Idempotent; returns true when this call
    /// performed the transition. Unknown sessions are a no-op: the disconnect
    /// path may race in-memory eviction.
    pub async fn end_session(&self, session_id: &str) -> bool {
        let Some(cell) = self.cell(session_id) else {
            return false;
        };

        let batch = {
            let mut session = cell.lock();
            if !session.is_active {
                return false;
            }
            session.end();
            SessionBatch::snapshot(&session)
        };

        metrics().sessions_ended.inc();
        metrics().active_sessions.set(self.active_count() as u64);
        info!(session_id = session_id, "Session ended");

        for observer in self.observers() {
            observer.session_ended(session_id);
        }
        self.batcher.enqueue(batch).await;
        true
    }

    /// Refreshes `last_activity` without emitting anything.
    pub fn heartbeat(&self, session_id: &str) -> Result<()> {
        let cell = self
            .cell(session_id)
            .ok_or_else(|| Error::routing(format!("unknown session: {session_id}")))?;
        cell.lock().touch();
        Ok(())
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.cell(session_id)
            .map(|cell| cell.lock().is_active)
            .unwrap_or(false)
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.cell(session_id).map(|cell| cell.lock().snapshot())
    }

    /// Slice of the current buffer. `from_index` addresses the buffer, not
    /// the full stream; see [`MemoryPage::buffer_complete`].
    pub fn events_page(
        &self,
        session_id: &str,
        from_index: usize,
        limit: usize,
    ) -> Option<MemoryPage> {
        let cell = self.cell(session_id)?;
        let session = cell.lock();

        let events: Vec<Value> = session
            .events
            .iter()
            .skip(from_index)
            .take(limit)
            .cloned()
            .collect();

        Some(MemoryPage {
            events,
            total_events: session.total_events,
            buffer_complete: session.events.len() as u64 == session.total_events,
        })
    }

    /// Snapshots of active sessions, most recently active first.
    pub fn active_snapshots(&self) -> Vec<SessionSnapshot> {
        let cells: Vec<Arc<Mutex<Session>>> = self.sessions.read().values().cloned().collect();
        let mut snapshots: Vec<SessionSnapshot> = cells
            .iter()
            .map(|cell| cell.lock().snapshot())
            .filter(|s| s.is_active)
            .collect();
        snapshots.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        snapshots
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn active_count(&self) -> usize {
        let cells: Vec<Arc<Mutex<Session>>> = self.sessions.read().values().cloned().collect();
        cells.iter().filter(|cell| cell.lock().is_active).count()
    }

    /// Removes inactive sessions idle longer than `max_idle`. The candidate
    /// scan takes the map read lock briefly; candidates are re-checked under
    /// the write lock so a racing re-activation survives.
    pub fn evict_stale(&self, max_idle: Duration) -> usize {
        let candidates: Vec<String> = {
            let map = self.sessions.read();
            map.iter()
                .filter(|(_, cell)| {
                    let session = cell.lock();
                    !session.is_active && session.idle_longer_than(max_idle)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        if candidates.is_empty() {
            return 0;
        }

        let mut evicted = 0;
        {
            let mut map = self.sessions.write();
            for id in &candidates {
                let still_stale = map
                    .get(id)
                    .map(|cell| {
                        let session = cell.lock();
                        !session.is_active && session.idle_longer_than(max_idle)
                    })
                    .unwrap_or(false);
                if still_stale {
                    map.remove(id);
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            debug!(evicted = evicted, "Evicted stale sessions from memory");
        }
        evicted
    }

    /// Mints a replacement session id: monotonic millisecond stamp plus a
    /// random nonce.
    pub fn mint_session_id(&self) -> String {
        let nonce = Uuid::new_v4().simple().to_string();
        format!("sess_{}_{}", Utc::now().timestamp_millis(), &nonce[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batcher::{BatcherConfig, MemorySink};
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingObserver {
        log: PlMutex<Vec<String>>,
    }

    impl SessionObserver for RecordingObserver {
        fn session_started(&self, session_id: &str, _user_id: &str, _metadata: &Value) {
            self.log.lock().push(format!("started:{session_id}"));
        }
        fn session_ended(&self, session_id: &str) {
            self.log.lock().push(format!("ended:{session_id}"));
        }
        fn events_added(&self, session_id: &str, events: &[Value]) {
            self.log
                .lock()
                .push(format!("events:{session_id}:{}", events.len()));
        }
        fn error_added(&self, session_id: &str, kind: &str, _error: &Value) {
            self.log.lock().push(format!("error:{session_id}:{kind}"));
        }
    }

    fn registry_with(max_events: usize) -> (SessionRegistry, MemorySink, Arc<RecordingObserver>) {
        let sink = MemorySink::new();
        let batcher = Arc::new(Batcher::new(
            Arc::new(sink.clone()),
            BatcherConfig {
                batch_size: 100,
                batch_interval_ms: 60_000,
            },
        ));
        let registry = SessionRegistry::new(batcher, max_events);
        let observer = Arc::new(RecordingObserver::default());
        registry.subscribe(observer.clone());
        (registry, sink, observer)
    }

    #[tokio::test]
    async fn test_start_emits_and_enqueues_snapshot() {
        let (registry, _, observer) = registry_with(100);
        registry.start_session("s1", "u1", json!({"url": "/a"})).await;

        assert!(registry.is_active("s1"));
        assert_eq!(observer.log.lock().clone(), vec!["started:s1".to_string()]);
        assert_eq!(registry.batcher.queue_depth(), 1);
    }

    #[tokio::test]
    async fn test_append_requires_active_session() {
        let (registry, _, _) = registry_with(100);
        registry.start_session("s1", "u1", json!({})).await;
        registry.end_session("s1").await;

        let err = registry
            .append_events("s1", vec![json!({"k": 1})])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionInactive(_)));
    }

    #[tokio::test]
    async fn test_append_unknown_session_is_routing_error() {
        let (registry, _, _) = registry_with(100);
        let err = registry.append_events("nope", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Routing(_)));
    }

    #[tokio::test]
    async fn test_batches_carry_only_new_events() {
        let (registry, sink, _) = registry_with(100);
        registry.start_session("s1", "u1", json!({})).await;
        registry
            .append_events("s1", vec![json!({"k": 1}), json!({"k": 2})])
            .await
            .unwrap();
        registry
            .append_events("s1", vec![json!({"k": 3})])
            .await
            .unwrap();

        registry.batcher.flush_once().await.unwrap();

        let applied = sink.applied();
        // Snapshot batch from start, then one batch per append.
        assert_eq!(applied.len(), 3);
        assert!(applied[0].events.is_empty());
        assert_eq!(applied[1].events.len(), 2);
        assert_eq!(applied[2].events.len(), 1);
        assert_eq!(applied[2].events[0]["k"], 3);
    }

    #[tokio::test]
    async fn test_trim_at_cap_keeps_tail() {
        let (registry, _, _) = registry_with(10);
        registry.start_session("s1", "u1", json!({})).await;
        let events: Vec<Value> = (0..11).map(|i| json!({"k": i})).collect();
        registry.append_events("s1", events).await.unwrap();

        let page = registry.events_page("s1", 0, 100).unwrap();
        assert_eq!(page.events.len(), 5);
        assert_eq!(page.total_events, 11);
        assert!(!page.buffer_complete);
        assert_eq!(page.events[0]["k"], 6);
        assert_eq!(page.events[4]["k"], 10);
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let (registry, _, observer) = registry_with(100);
        registry.start_session("s1", "u1", json!({})).await;

        assert!(registry.end_session("s1").await);
        assert!(!registry.end_session("s1").await);
        assert!(!registry.end_session("unknown").await);

        let ended = observer
            .log
            .lock()
            .iter()
            .filter(|e| e.starts_with("ended:"))
            .count();
        assert_eq!(ended, 1);
    }

    #[tokio::test]
    async fn test_reactivation_of_ended_session() {
        let (registry, _, _) = registry_with(100);
        registry.start_session("s1", "u1", json!({"v": 1})).await;
        registry
            .append_events("s1", vec![json!({"k": 1})])
            .await
            .unwrap();
        registry.end_session("s1").await;

        let snap = registry.start_session("s1", "u2", json!({"v": 2})).await;
        assert!(snap.is_active);
        assert_eq!(snap.user_id, "u2");
        // The event stream survives re-activation.
        assert_eq!(snap.event_count, 1);
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn test_errors_recorded_after_end() {
        let (registry, _, observer) = registry_with(100);
        registry.start_session("s1", "u1", json!({})).await;
        registry.end_session("s1").await;

        registry
            .record_error("s1", "javascript_error", json!({"msg": "boom"}))
            .await
            .unwrap();
        assert!(observer
            .log
            .lock()
            .contains(&"error:s1:javascript_error".to_string()));
    }

    #[tokio::test]
    async fn test_evict_only_inactive_sessions() {
        let (registry, _, _) = registry_with(100);
        registry.start_session("live", "u1", json!({})).await;
        registry.start_session("done", "u1", json!({})).await;
        registry.end_session("done").await;
        std::thread::sleep(std::time::Duration::from_millis(2));

        // Zero idle threshold: anything inactive is stale.
        let evicted = registry.evict_stale(Duration::zero());
        assert_eq!(evicted, 1);
        assert!(registry.snapshot("done").is_none());
        assert!(registry.snapshot("live").is_some());
    }

    #[tokio::test]
    async fn test_minted_ids_are_unique() {
        let (registry, _, _) = registry_with(100);
        let a = registry.mint_session_id();
        let b = registry.mint_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with("sess_"));
    }

    #[tokio::test]
    async fn test_active_snapshots_sorted_by_recency() {
        let (registry, _, _) = registry_with(100);
        registry.start_session("s1", "u1", json!({})).await;
        registry.start_session("s2", "u1", json!({})).await;
        registry.append_events("s1", vec![json!({})]).await.unwrap();

        let snaps = registry.active_snapshots();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].session_id, "s1");
    }
}
