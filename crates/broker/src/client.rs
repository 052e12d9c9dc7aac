//! Per-connection client state.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Connection identifier, assigned at registration.
pub type ClientId = Uuid;

/// How the connection classified itself at upgrade time (`?type=` query
/// parameter; missing value defaults to tracker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Tracker,
    Viewer,
}

impl ClientRole {
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("viewer") => Self::Viewer,
            _ => Self::Tracker,
        }
    }

    pub fn is_viewer(&self) -> bool {
        matches!(self, Self::Viewer)
    }
}

/// Command for a connection's dedicated writer task.
///
/// All frames for one connection funnel through a single channel, so
/// broadcasts and direct replies never interleave bytes on the socket.
#[derive(Debug, Clone)]
pub enum WsCommand {
    Send(String),
    Ping,
    Close(String),
}

/// State the hub tracks per connection.
#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    pub role: ClientRole,
    /// The session this tracker currently owns.
    pub session_id: Option<String>,
    /// Sessions this viewer receives filtered broadcasts for. Mutated only
    /// from the owning connection's inbound handler.
    pub watched: HashSet<String>,
    pub joined_at: DateTime<Utc>,
    pub last_heartbeat: Instant,
    tx: mpsc::UnboundedSender<WsCommand>,
}

impl Client {
    pub fn new(role: ClientRole) -> (Self, mpsc::UnboundedReceiver<WsCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Self {
            id: Uuid::new_v4(),
            role,
            session_id: None,
            watched: HashSet::new(),
            joined_at: Utc::now(),
            last_heartbeat: Instant::now(),
            tx,
        };
        (client, rx)
    }

    /// Queues a frame on the writer channel. Errors (writer gone) are
    /// ignored; the reader loop notices the closed socket and cleans up.
    pub fn send(&self, command: WsCommand) {
        let _ = self.tx.send(command);
    }

    pub fn send_text(&self, frame: String) {
        self.send(WsCommand::Send(frame));
    }

    /// Clones the writer handle for use outside the client-map lock.
    pub fn sender(&self) -> mpsc::UnboundedSender<WsCommand> {
        self.tx.clone()
    }
}
