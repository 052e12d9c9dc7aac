//! API routes.

pub mod health;
pub mod sessions;
pub mod ws;

use axum::{
    routing::{delete, get},
    Json, Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::response::ServiceInfo;
use crate::state::AppState;

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health::health_handler))
        .route("/stats", get(health::stats_handler))
        .route("/sessions", get(sessions::list_handler))
        .route("/sessions/active", get(sessions::active_handler))
        .route("/sessions/cleanup", delete(sessions::cleanup_handler))
        .route("/sessions/:id/events", get(sessions::events_handler))
        .route("/ws", get(ws::upgrade_handler))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// GET / - Service identification.
async fn root_handler() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: "replay-relay",
        version: env!("CARGO_PKG_VERSION"),
    })
}
