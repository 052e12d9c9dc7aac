//! WebSocket upgrade into the connection hub.

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::IntoResponse,
};
use broker::ClientRole;
use serde::Deserialize;
use tracing::debug;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UpgradeQuery {
    /// `viewer` or `tracker`; anything else (or nothing) means tracker.
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// GET /ws?type=viewer|tracker - Promotes the connection into the hub.
pub async fn upgrade_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<UpgradeQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let role = ClientRole::from_query(query.kind.as_deref());
    debug!(role = ?role, "WebSocket upgrade");

    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| hub.handle_socket(socket, role))
}
