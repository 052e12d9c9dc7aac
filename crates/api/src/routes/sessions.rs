//! Session listing and event query endpoints, backed by the store.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use tracing::info;

use crate::response::{
    ActiveSessionsResponse, ApiError, CleanupResponse, SessionEventsResponse, SessionListResponse,
};
use crate::state::AppState;

const MAX_PAGE_LIMIT: i64 = 500;

/// GET /sessions/active - Persisted active sessions with counts.
pub async fn active_handler(
    State(state): State<AppState>,
) -> Result<Json<ActiveSessionsResponse>, ApiError> {
    let sessions = store::query::active_sessions(&state.store).await?;
    Ok(Json(ActiveSessionsResponse { sessions }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// GET /sessions?limit&offset - Full paginated session index.
pub async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<SessionListResponse>, ApiError> {
    if query.limit < 1 || query.limit > MAX_PAGE_LIMIT {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {MAX_PAGE_LIMIT}"
        )));
    }
    if query.offset < 0 {
        return Err(ApiError::bad_request("offset must not be negative"));
    }

    let sessions = store::query::all_sessions(&state.store, query.limit, query.offset).await?;
    Ok(Json(SessionListResponse {
        sessions,
        limit: query.limit,
        offset: query.offset,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(rename = "fromIndex", default)]
    from_index: usize,
    #[serde(default = "default_events_limit")]
    limit: usize,
}

fn default_events_limit() -> usize {
    100
}

/// GET /sessions/:id/events?fromIndex&limit - Event-level pagination over
/// the persisted stream. Unknown sessions and past-the-end offsets return
/// an empty page.
pub async fn events_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<SessionEventsResponse>, ApiError> {
    if query.limit == 0 {
        return Err(ApiError::bad_request("limit must be positive"));
    }

    let page = store::query::session_events_page(
        &state.store,
        &session_id,
        query.from_index,
        query.limit,
    )
    .await?;

    Ok(Json(SessionEventsResponse {
        session_id,
        count: page.events.len(),
        events: page.events,
        from_index: query.from_index,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    #[serde(rename = "maxAgeHours", default = "default_max_age_hours")]
    max_age_hours: i32,
}

fn default_max_age_hours() -> i32 {
    720
}

/// DELETE /sessions/cleanup?maxAgeHours - Operator-triggered retention pass.
pub async fn cleanup_handler(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> Result<Json<CleanupResponse>, ApiError> {
    if query.max_age_hours < 1 {
        return Err(ApiError::bad_request("maxAgeHours must be positive"));
    }

    let deleted_count =
        store::query::cleanup_old_sessions(&state.store, query.max_age_hours).await?;
    info!(
        deleted = deleted_count,
        max_age_hours = query.max_age_hours,
        "Manual session cleanup"
    );
    Ok(Json(CleanupResponse { deleted_count }))
}
