//! Connection hub: accepts duplex connections, classifies them, routes
//! inbound frames to the registry, and fans registry events back out.
//!
//! Each connection runs an independent reader loop; all writes to a
//! connection flow through its dedicated writer task so broadcast frames and
//! direct replies never interleave. Broadcasts snapshot the writer handles
//! under the client-map lock and send after releasing it.

use crate::client::{Client, ClientId, ClientRole, WsCommand};
use crate::messages::{relay_frame, Envelope, Inbound, Outbound};
use crate::registry::{SessionObserver, SessionRegistry};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use relay_core::BrokerConfig;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::SessionStore;
use telemetry::metrics;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// A connection silent for longer than this is closed by the sweep.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Events per `session_events` reply page.
const EVENT_PAGE_SIZE: usize = 100;

/// Live connection counts.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct HubCounts {
    pub total: usize,
    pub trackers: usize,
    pub viewers: usize,
}

/// Shared client map. Split out of the hub so the registry-facing fan-out
/// half can be handed to the registry without an ownership cycle.
#[derive(Default)]
struct ClientMap {
    inner: Mutex<HashMap<ClientId, Client>>,
}

impl ClientMap {
    fn insert(&self, client: Client) {
        self.inner.lock().insert(client.id, client);
    }

    fn remove(&self, id: ClientId) -> Option<Client> {
        self.inner.lock().remove(&id)
    }

    fn counts(&self) -> HubCounts {
        let map = self.inner.lock();
        let trackers = map.values().filter(|c| !c.role.is_viewer()).count();
        HubCounts {
            total: map.len(),
            trackers,
            viewers: map.len() - trackers,
        }
    }

    fn send_to(&self, id: ClientId, frame: String) {
        if let Some(client) = self.inner.lock().get(&id) {
            client.send_text(frame);
        }
    }

    /// Sends a frame to every viewer.
    fn broadcast_viewers(&self, frame: &str) {
        let senders: Vec<_> = {
            let map = self.inner.lock();
            map.values()
                .filter(|c| c.role.is_viewer())
                .map(|c| c.sender())
                .collect()
        };
        for tx in senders {
            let _ = tx.send(WsCommand::Send(frame.to_string()));
        }
    }

    /// Sends a frame to viewers whose watched set contains the session.
    fn broadcast_watchers(&self, session_id: &str, frame: &str) {
        let senders: Vec<_> = {
            let map = self.inner.lock();
            map.values()
                .filter(|c| c.role.is_viewer() && c.watched.contains(session_id))
                .map(|c| c.sender())
                .collect()
        };
        for tx in senders {
            let _ = tx.send(WsCommand::Send(frame.to_string()));
        }
    }

    fn send_to_command(&self, id: ClientId, command: WsCommand) {
        if let Some(client) = self.inner.lock().get(&id) {
            client.send(command);
        }
    }

    /// Drops clients silent past `timeout` (queueing a close frame first)
    /// and pings the rest. Returns the dropped clients' roles and owned
    /// sessions so the hub can run the disconnect path.
    fn sweep(&self, timeout: Duration) -> Vec<(ClientRole, Option<String>)> {
        let now = Instant::now();
        let mut dropped = Vec::new();

        let mut map = self.inner.lock();
        map.retain(|id, client| {
            if now.duration_since(client.last_heartbeat) > timeout {
                warn!(client_id = %id, "Heartbeat timeout, closing connection");
                client.send(WsCommand::Close("Heartbeat timeout".to_string()));
                dropped.push((client.role, client.session_id.clone()));
                false
            } else {
                client.send(WsCommand::Ping);
                true
            }
        });
        dropped
    }
}

/// The registry-facing half of the hub: translates domain events into wire
/// broadcasts. Owns only the client map.
struct HubFanout {
    clients: Arc<ClientMap>,
}

impl SessionObserver for HubFanout {
    fn session_started(&self, session_id: &str, user_id: &str, metadata: &Value) {
        let frame = Outbound::SessionStarted {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            metadata: metadata.clone(),
        }
        .to_frame();
        self.clients.broadcast_viewers(&frame);
    }

    fn session_ended(&self, session_id: &str) {
        let frame = Outbound::SessionEnded {
            session_id: session_id.to_string(),
        }
        .to_frame();
        self.clients.broadcast_viewers(&frame);
    }

    fn events_added(&self, session_id: &str, events: &[Value]) {
        let frame = Outbound::EventsBatch {
            session_id: session_id.to_string(),
            events: events.to_vec(),
        }
        .to_frame();
        self.clients.broadcast_watchers(session_id, &frame);
        metrics().events_broadcast.inc_by(events.len() as u64);
    }

    fn error_added(&self, session_id: &str, kind: &str, error: &Value) {
        let frame = relay_frame(kind, session_id, error);
        self.clients.broadcast_watchers(session_id, &frame);
    }
}

pub struct ConnectionHub {
    clients: Arc<ClientMap>,
    registry: Arc<SessionRegistry>,
    store: SessionStore,
    config: BrokerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConnectionHub {
    /// Builds the hub and wires its fan-out half into the registry.
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: SessionStore,
        config: BrokerConfig,
    ) -> Arc<Self> {
        let clients = Arc::new(ClientMap::default());
        registry.subscribe(Arc::new(HubFanout {
            clients: clients.clone(),
        }));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Arc::new(Self {
            clients,
            registry,
            store,
            config,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Registers a connection and returns its writer channel. Viewers are
    /// immediately sent the current `active_sessions` snapshot.
    pub fn register(&self, role: ClientRole) -> (ClientId, mpsc::UnboundedReceiver<WsCommand>) {
        let (client, rx) = Client::new(role);
        let id = client.id;

        if role.is_viewer() {
            client.send_text(
                Outbound::ActiveSessions {
                    sessions: self.registry.active_snapshots(),
                }
                .to_frame(),
            );
        }

        self.clients.insert(client);
        self.refresh_gauges();
        debug!(client_id = %id, role = ?role, "Client connected");
        (id, rx)
    }

    /// Runs the disconnect path: drops the client and, for a tracker that
    /// owns a session, ends it.
    pub async fn disconnect(&self, id: ClientId) {
        let Some(client) = self.clients.remove(id) else {
            return;
        };
        self.refresh_gauges();
        debug!(client_id = %id, role = ?client.role, "Client disconnected");

        if let Some(session_id) = client.session_id {
            self.registry.end_session(&session_id).await;
        }
    }

    /// Refreshes a client's heartbeat stamp (pong receipt).
    pub fn touch(&self, id: ClientId) {
        if let Some(client) = self.clients.inner.lock().get_mut(&id) {
            client.last_heartbeat = Instant::now();
        }
    }

    pub fn counts(&self) -> HubCounts {
        self.clients.counts()
    }

    /// Parses one inbound frame and dispatches it by the client's role.
    /// Every inbound frame refreshes the heartbeat stamp.
    pub async fn handle_message(&self, id: ClientId, text: &str) {
        metrics().messages_received.inc();

        let inbound = match Envelope::parse(text).and_then(Inbound::from_envelope) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(client_id = %id, error = %e, "Rejected inbound frame");
                self.reply_error(id, e.to_string());
                return;
            }
        };

        let role = {
            let mut map = self.clients.inner.lock();
            let Some(client) = map.get_mut(&id) else {
                return;
            };
            client.last_heartbeat = Instant::now();
            client.role
        };

        match role {
            ClientRole::Tracker => self.handle_tracker(id, inbound).await,
            ClientRole::Viewer => self.handle_viewer(id, inbound).await,
        }
    }

    async fn handle_tracker(&self, id: ClientId, inbound: Inbound) {
        match inbound {
            Inbound::SessionStart(start) => {
                let requested = start.session_id;
                let (assigned, reassigned, previous) = self.claim_session(id, &requested);

                if reassigned {
                    metrics().sessions_reassigned.inc();
                    info!(
                        requested = %requested,
                        assigned = %assigned,
                        "Session id already owned by another tracker, reassigning"
                    );
                    self.clients.send_to(
                        id,
                        Outbound::SessionAssigned {
                            session_id: assigned.clone(),
                        }
                        .to_frame(),
                    );
                }

                // A tracker owns at most one session; starting a new one
                // ends whatever it owned before.
                if let Some(previous) = previous {
                    if previous != assigned {
                        self.registry.end_session(&previous).await;
                    }
                }

                self.registry
                    .start_session(&assigned, &start.user_id, start.metadata)
                    .await;
            }

            Inbound::EventsBatch(events) => {
                let Some(session_id) = self.owned_session(id) else {
                    self.reply_error(id, "events_batch before session_start");
                    return;
                };
                if let Err(e) = self.registry.append_events(&session_id, events).await {
                    self.reply_error(id, e.to_string());
                }
            }

            Inbound::SessionEnd { session_id } => {
                let owned = self.owned_session(id);
                let target = session_id.or_else(|| owned.clone());
                if let Some(session_id) = target {
                    self.registry.end_session(&session_id).await;
                    if owned.as_deref() == Some(session_id.as_str()) {
                        self.set_owned_session(id, None);
                    }
                }
            }

            Inbound::Heartbeat { session_id } => {
                let target = session_id.or_else(|| self.owned_session(id));
                if let Some(session_id) = target {
                    let _ = self.registry.heartbeat(&session_id);
                }
            }

            Inbound::TrackerError { kind, payload } => {
                let Some(session_id) = self.owned_session(id) else {
                    self.reply_error(id, format!("{} before session_start", kind.as_str()));
                    return;
                };
                if let Err(e) = self
                    .registry
                    .record_error(&session_id, kind.as_str(), payload)
                    .await
                {
                    self.reply_error(id, e.to_string());
                }
            }

            Inbound::VisibilityChange(payload) => {
                let Some(session_id) = self.owned_session(id) else {
                    self.reply_error(id, "visibility_change before session_start");
                    return;
                };
                let frame = relay_frame("visibility_change", &session_id, &payload);
                self.clients.broadcast_watchers(&session_id, &frame);
            }

            Inbound::Unknown(kind) => {
                debug!(client_id = %id, kind = %kind, "Dropping unknown message type");
            }

            Inbound::GetActiveSessions
            | Inbound::ViewerJoin { .. }
            | Inbound::ViewerLeave { .. }
            | Inbound::GetSessionEvents { .. } => {
                self.reply_error(id, "viewer messages are not accepted from trackers");
            }
        }
    }

    async fn handle_viewer(&self, id: ClientId, inbound: Inbound) {
        match inbound {
            Inbound::GetActiveSessions => {
                self.clients.send_to(
                    id,
                    Outbound::ActiveSessions {
                        sessions: self.registry.active_snapshots(),
                    }
                    .to_frame(),
                );
            }

            Inbound::ViewerJoin { session_id } => {
                let Some(snapshot) = self.registry.snapshot(&session_id) else {
                    self.reply_error(id, format!("unknown session: {session_id}"));
                    return;
                };

                {
                    let mut map = self.clients.inner.lock();
                    if let Some(client) = map.get_mut(&id) {
                        client.watched.insert(session_id.clone());
                    }
                }

                self.clients.send_to(
                    id,
                    Outbound::SessionJoined {
                        session_id,
                        events: Vec::new(),
                        metadata: snapshot.metadata,
                        total_events: snapshot.event_count,
                        is_active: snapshot.is_active,
                    }
                    .to_frame(),
                );
            }

            Inbound::ViewerLeave { session_id } => {
                let mut map = self.clients.inner.lock();
                if let Some(client) = map.get_mut(&id) {
                    client.watched.remove(&session_id);
                }
            }

            Inbound::GetSessionEvents {
                session_id,
                from_index,
            } => {
                self.send_event_page(id, session_id, from_index).await;
            }

            Inbound::Heartbeat { .. } => {}

            Inbound::Unknown(kind) => {
                debug!(client_id = %id, kind = %kind, "Dropping unknown message type");
            }

            Inbound::SessionStart(_)
            | Inbound::EventsBatch(_)
            | Inbound::SessionEnd { .. }
            | Inbound::TrackerError { .. }
            | Inbound::VisibilityChange(_) => {
                self.reply_error(id, "tracker messages are not accepted from viewers");
            }
        }
    }

    /// Replies with a page of a session's event stream.
    ///
    /// The in-memory buffer serves the page while it still holds the whole
    /// stream; once trimming has discarded history the buffer index no
    /// longer matches the stream index, so the store takes over.
    async fn send_event_page(&self, id: ClientId, session_id: String, from_index: usize) {
        if let Some(page) = self
            .registry
            .events_page(&session_id, from_index, EVENT_PAGE_SIZE)
        {
            if page.buffer_complete {
                let total = page.total_events;
                let has_more = from_index + page.events.len() < total as usize;
                self.clients.send_to(
                    id,
                    Outbound::SessionEvents {
                        session_id,
                        events: page.events,
                        from_index,
                        total_events: total,
                        has_more,
                    }
                    .to_frame(),
                );
                return;
            }
        }

        match store::query::session_events_page(
            &self.store,
            &session_id,
            from_index,
            EVENT_PAGE_SIZE,
        )
        .await
        {
            Ok(page) => {
                let has_more = from_index + page.events.len() < page.total;
                self.clients.send_to(
                    id,
                    Outbound::SessionEvents {
                        session_id,
                        events: page.events,
                        from_index,
                        total_events: page.total as u64,
                        has_more,
                    }
                    .to_frame(),
                );
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Failed to load session events");
                self.reply_error(id, "failed to load session events");
            }
        }
    }

    /// Drives one accepted WebSocket until it closes.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, role: ClientRole) {
        let (id, mut rx) = self.register(role);
        let (mut ws_tx, mut ws_rx) = socket.split();

        // Writer task: the only place that touches the sink half.
        let writer = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let result = match command {
                    WsCommand::Send(text) => ws_tx.send(Message::Text(text)).await,
                    WsCommand::Ping => ws_tx.send(Message::Ping(Vec::new())).await,
                    WsCommand::Close(reason) => {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::NORMAL,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        });

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_message(id, &text).await,
                        Some(Ok(Message::Pong(_))) => self.touch(id),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!(client_id = %id, error = %e, "WebSocket read error");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        self.clients
                            .send_to_command(id, WsCommand::Close("server shutting down".to_string()));
                        break;
                    }
                }
            }
        }

        self.disconnect(id).await;
        // Dropping the client dropped its sender; the writer drains and exits.
        let _ = writer.await;
    }

    /// Starts the heartbeat sweep. Pings every live client each interval and
    /// closes the ones silent past the 60s threshold, running the same
    /// disconnect path as a client-initiated close.
    pub fn start_heartbeat_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let hub = self.clone();
        let mut shutdown_rx = hub.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.config.heartbeat_interval());
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
                hub.sweep(CLIENT_TIMEOUT).await;
            }
        })
    }

    async fn sweep(&self, timeout: Duration) {
        let dropped = self.clients.sweep(timeout);
        if dropped.is_empty() {
            return;
        }

        self.refresh_gauges();
        for (role, session_id) in dropped {
            if role == ClientRole::Tracker {
                if let Some(session_id) = session_id {
                    self.registry.end_session(&session_id).await;
                }
            }
        }
    }

    /// Signals shutdown to every connection loop and the sweep task.
    pub fn shutdown(&self) {
        info!("Connection hub shutting down");
        let _ = self.shutdown_tx.send(true);
    }

    fn owned_session(&self, id: ClientId) -> Option<String> {
        self.clients
            .inner
            .lock()
            .get(&id)
            .and_then(|c| c.session_id.clone())
    }

    fn set_owned_session(&self, id: ClientId, session_id: Option<String>) {
        if let Some(client) = self.clients.inner.lock().get_mut(&id) {
            client.session_id = session_id;
        }
    }

    /// Decides whether the tracker keeps its requested session id or gets a
    /// replacement, and records ownership. The duplicate check and the claim
    /// happen under one lock, so two trackers racing the same id cannot both
    /// win it. Returns `(assigned, reassigned, previously_owned)`.
    fn claim_session(&self, id: ClientId, requested: &str) -> (String, bool, Option<String>) {
        let mut map = self.clients.inner.lock();

        let taken = map
            .values()
            .any(|c| c.id != id && c.session_id.as_deref() == Some(requested));
        let conflict = taken && self.registry.is_active(requested);

        let assigned = if conflict {
            self.registry.mint_session_id()
        } else {
            requested.to_string()
        };

        let previous = map.get(&id).and_then(|c| c.session_id.clone());
        if let Some(client) = map.get_mut(&id) {
            client.session_id = Some(assigned.clone());
        }
        (assigned, conflict, previous)
    }

    fn reply_error(&self, id: ClientId, message: impl Into<String>) {
        self.clients
            .send_to(id, Outbound::error(message).to_frame());
    }

    fn refresh_gauges(&self) {
        let counts = self.clients.counts();
        metrics().connected_trackers.set(counts.trackers as u64);
        metrics().connected_viewers.set(counts.viewers as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batcher::{Batcher, BatcherConfig, MemorySink};
    use serde_json::json;
    use store::StoreConfig;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_hub() -> (Arc<ConnectionHub>, MemorySink, Arc<Batcher>) {
        let sink = MemorySink::new();
        let batcher = Arc::new(Batcher::new(
            Arc::new(sink.clone()),
            BatcherConfig {
                batch_size: 100,
                batch_interval_ms: 60_000,
            },
        ));
        let config = BrokerConfig {
            max_events_per_session: 10,
            heartbeat_interval_ms: 30_000,
        };
        let registry = Arc::new(SessionRegistry::new(
            batcher.clone(),
            config.max_events_per_session,
        ));
        // Lazy pool: no connection is opened unless a store-backed path runs.
        let store = SessionStore::connect_lazy(StoreConfig::default());
        let hub = ConnectionHub::new(registry, store, config);
        (hub, sink, batcher)
    }

    fn drain(rx: &mut UnboundedReceiver<WsCommand>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(command) = rx.try_recv() {
            if let WsCommand::Send(text) = command {
                frames.push(serde_json::from_str(&text).unwrap());
            }
        }
        frames
    }

    fn frames_of_type(frames: &[Value], kind: &str) -> Vec<Value> {
        frames
            .iter()
            .filter(|f| f["type"] == kind)
            .cloned()
            .collect()
    }

    async fn start_session(hub: &ConnectionHub, tracker: ClientId, session_id: &str) {
        hub.handle_message(
            tracker,
            &json!({
                "type": "session_start",
                "data": {"sessionId": session_id, "userId": "u1", "url": "/a"}
            })
            .to_string(),
        )
        .await;
    }

    #[tokio::test]
    async fn test_join_then_stream() {
        let (hub, _, _) = test_hub();

        let (tracker, mut tracker_rx) = hub.register(ClientRole::Tracker);
        start_session(&hub, tracker, "s1").await;

        // Viewer connects after the session exists and sees it in the
        // initial snapshot.
        let (viewer, mut viewer_rx) = hub.register(ClientRole::Viewer);
        let frames = drain(&mut viewer_rx);
        let snapshot = &frames_of_type(&frames, "active_sessions")[0];
        assert_eq!(snapshot["data"]["sessions"][0]["sessionId"], "s1");

        hub.handle_message(
            viewer,
            &json!({"type": "viewer_join_session", "data": {"sessionId": "s1"}}).to_string(),
        )
        .await;
        let frames = drain(&mut viewer_rx);
        let joined = &frames_of_type(&frames, "session_joined")[0];
        assert_eq!(joined["data"]["sessionId"], "s1");
        assert_eq!(joined["data"]["totalEvents"], 0);
        assert_eq!(joined["data"]["isActive"], true);
        assert_eq!(joined["data"]["events"].as_array().unwrap().len(), 0);

        hub.handle_message(
            tracker,
            &json!({"type": "events_batch", "data": {"events": [{"k": 1}, {"k": 2}]}}).to_string(),
        )
        .await;
        let frames = drain(&mut viewer_rx);
        let batch = &frames_of_type(&frames, "events_batch")[0];
        assert_eq!(batch["data"]["sessionId"], "s1");
        assert_eq!(batch["data"]["events"], json!([{"k": 1}, {"k": 2}]));

        // The tracker got no error replies along the way.
        assert!(frames_of_type(&drain(&mut tracker_rx), "error").is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_filtered_by_watched_set() {
        let (hub, _, _) = test_hub();

        let (tracker, _tracker_rx) = hub.register(ClientRole::Tracker);
        start_session(&hub, tracker, "s1").await;

        let (_viewer, mut viewer_rx) = hub.register(ClientRole::Viewer);
        drain(&mut viewer_rx);

        // Not watching s1: the live delta must not arrive.
        hub.handle_message(
            tracker,
            &json!({"type": "events_batch", "data": {"events": [{"k": 1}]}}).to_string(),
        )
        .await;
        assert!(frames_of_type(&drain(&mut viewer_rx), "events_batch").is_empty());
    }

    #[tokio::test]
    async fn test_id_conflict_reassigns_second_tracker() {
        let (hub, _, _) = test_hub();

        let (t1, _t1_rx) = hub.register(ClientRole::Tracker);
        start_session(&hub, t1, "s2").await;

        let (t2, mut t2_rx) = hub.register(ClientRole::Tracker);
        start_session(&hub, t2, "s2").await;

        let frames = drain(&mut t2_rx);
        let assigned = &frames_of_type(&frames, "session_assigned")[0];
        let new_id = assigned["data"]["sessionId"].as_str().unwrap().to_string();
        assert_ne!(new_id, "s2");

        // Subsequent t2 events land under the new id.
        hub.handle_message(
            t2,
            &json!({"type": "events_batch", "data": {"events": [{"k": 9}]}}).to_string(),
        )
        .await;
        let original = hub.registry.snapshot("s2").unwrap();
        let reassigned = hub.registry.snapshot(&new_id).unwrap();
        assert_eq!(original.event_count, 0);
        assert_eq!(reassigned.event_count, 1);
    }

    #[tokio::test]
    async fn test_same_tracker_restart_keeps_id() {
        let (hub, _, _) = test_hub();

        let (t1, mut t1_rx) = hub.register(ClientRole::Tracker);
        start_session(&hub, t1, "s1").await;
        start_session(&hub, t1, "s1").await;

        assert!(frames_of_type(&drain(&mut t1_rx), "session_assigned").is_empty());
        assert!(hub.registry.is_active("s1"));
    }

    #[tokio::test]
    async fn test_disconnect_ends_owned_session() {
        let (hub, _, _) = test_hub();

        let (tracker, _tracker_rx) = hub.register(ClientRole::Tracker);
        start_session(&hub, tracker, "s1").await;

        let (_viewer, mut viewer_rx) = hub.register(ClientRole::Viewer);
        drain(&mut viewer_rx);

        hub.disconnect(tracker).await;

        let frames = drain(&mut viewer_rx);
        let ended = frames_of_type(&frames, "session_ended");
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0]["data"]["sessionId"], "s1");
        assert!(!hub.registry.is_active("s1"));
    }

    #[tokio::test]
    async fn test_no_broadcast_after_session_end() {
        let (hub, _, _) = test_hub();

        let (tracker, mut tracker_rx) = hub.register(ClientRole::Tracker);
        start_session(&hub, tracker, "s1").await;

        let (viewer, mut viewer_rx) = hub.register(ClientRole::Viewer);
        hub.handle_message(
            viewer,
            &json!({"type": "viewer_join_session", "data": {"sessionId": "s1"}}).to_string(),
        )
        .await;
        drain(&mut viewer_rx);

        hub.handle_message(
            tracker,
            &json!({"type": "session_end", "data": {"sessionId": "s1"}}).to_string(),
        )
        .await;
        hub.handle_message(
            tracker,
            &json!({"type": "events_batch", "data": {"events": [{"k": 1}]}}).to_string(),
        )
        .await;

        let viewer_frames = drain(&mut viewer_rx);
        assert_eq!(frames_of_type(&viewer_frames, "session_ended").len(), 1);
        assert!(frames_of_type(&viewer_frames, "events_batch").is_empty());
        // The tracker was told its batch could not be routed.
        assert!(!frames_of_type(&drain(&mut tracker_rx), "error").is_empty());
    }

    #[tokio::test]
    async fn test_role_routing_errors() {
        let (hub, _, _) = test_hub();

        let (tracker, mut tracker_rx) = hub.register(ClientRole::Tracker);
        let (viewer, mut viewer_rx) = hub.register(ClientRole::Viewer);
        drain(&mut viewer_rx);

        hub.handle_message(tracker, r#"{"type":"get_active_sessions"}"#).await;
        assert!(!frames_of_type(&drain(&mut tracker_rx), "error").is_empty());

        hub.handle_message(
            viewer,
            &json!({"type": "events_batch", "data": {"events": []}}).to_string(),
        )
        .await;
        assert!(!frames_of_type(&drain(&mut viewer_rx), "error").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_dropped_without_reply() {
        let (hub, _, _) = test_hub();
        let (tracker, mut tracker_rx) = hub.register(ClientRole::Tracker);

        hub.handle_message(tracker, r#"{"type":"mystery","data":{}}"#).await;
        assert!(drain(&mut tracker_rx).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_reply() {
        let (hub, _, _) = test_hub();
        let (tracker, mut tracker_rx) = hub.register(ClientRole::Tracker);

        hub.handle_message(tracker, "not json").await;
        assert!(!frames_of_type(&drain(&mut tracker_rx), "error").is_empty());
    }

    #[tokio::test]
    async fn test_live_event_paging_from_memory() {
        let (hub, _, _) = test_hub();

        let (tracker, _tracker_rx) = hub.register(ClientRole::Tracker);
        start_session(&hub, tracker, "s1").await;
        hub.handle_message(
            tracker,
            &json!({"type": "events_batch", "data": {"events": [{"k": 0}, {"k": 1}, {"k": 2}]}})
                .to_string(),
        )
        .await;

        let (viewer, mut viewer_rx) = hub.register(ClientRole::Viewer);
        drain(&mut viewer_rx);

        hub.handle_message(
            viewer,
            &json!({"type": "get_session_events", "data": {"sessionId": "s1", "fromIndex": 1}})
                .to_string(),
        )
        .await;
        let frames = drain(&mut viewer_rx);
        let page = &frames_of_type(&frames, "session_events")[0];
        assert_eq!(page["data"]["events"], json!([{"k": 1}, {"k": 2}]));
        assert_eq!(page["data"]["fromIndex"], 1);
        assert_eq!(page["data"]["totalEvents"], 3);
        assert_eq!(page["data"]["hasMore"], false);

        // Offset past the end of the stream: empty page, nothing more.
        hub.handle_message(
            viewer,
            &json!({"type": "get_session_events", "data": {"sessionId": "s1", "fromIndex": 50}})
                .to_string(),
        )
        .await;
        let frames = drain(&mut viewer_rx);
        let page = &frames_of_type(&frames, "session_events")[0];
        assert_eq!(page["data"]["events"].as_array().unwrap().len(), 0);
        assert_eq!(page["data"]["hasMore"], false);
    }

    #[tokio::test]
    async fn test_heartbeat_sweep_closes_silent_clients_once() {
        let (hub, _, _) = test_hub();

        let (tracker, mut tracker_rx) = hub.register(ClientRole::Tracker);
        start_session(&hub, tracker, "s1").await;
        let (_viewer, mut viewer_rx) = hub.register(ClientRole::Viewer);
        drain(&mut viewer_rx);
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Zero tolerance: everyone is overdue.
        hub.sweep(Duration::ZERO).await;

        let closes: Vec<_> = std::iter::from_fn(|| tracker_rx.try_recv().ok())
            .filter(|c| matches!(c, WsCommand::Close(_)))
            .collect();
        assert_eq!(closes.len(), 1);
        assert!(!hub.registry.is_active("s1"));
        assert_eq!(hub.counts().total, 0);

        // A second sweep finds nothing to do.
        hub.sweep(Duration::ZERO).await;
        assert!(!hub.registry.end_session("s1").await);
    }

    #[tokio::test]
    async fn test_viewer_leave_stops_deltas() {
        let (hub, _, _) = test_hub();

        let (tracker, _tracker_rx) = hub.register(ClientRole::Tracker);
        start_session(&hub, tracker, "s1").await;

        let (viewer, mut viewer_rx) = hub.register(ClientRole::Viewer);
        hub.handle_message(
            viewer,
            &json!({"type": "viewer_join_session", "data": {"sessionId": "s1"}}).to_string(),
        )
        .await;
        hub.handle_message(
            viewer,
            &json!({"type": "viewer_leave_session", "data": {"sessionId": "s1"}}).to_string(),
        )
        .await;
        drain(&mut viewer_rx);

        hub.handle_message(
            tracker,
            &json!({"type": "events_batch", "data": {"events": [{"k": 1}]}}).to_string(),
        )
        .await;
        assert!(frames_of_type(&drain(&mut viewer_rx), "events_batch").is_empty());
    }

    #[tokio::test]
    async fn test_batcher_receives_relayed_events() {
        let (hub, sink, batcher) = test_hub();

        let (tracker, _tracker_rx) = hub.register(ClientRole::Tracker);
        start_session(&hub, tracker, "s1").await;
        hub.handle_message(
            tracker,
            &json!({"type": "events_batch", "data": {"events": [{"k": 1}]}}).to_string(),
        )
        .await;

        batcher.flush_once().await.unwrap();
        let applied = sink.applied();
        assert!(applied
            .iter()
            .any(|b| b.session_id == "s1" && b.events.len() == 1));
    }
}
