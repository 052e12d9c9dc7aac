//! Read queries over persisted sessions.

use crate::client::{db_err, SessionStore};
use crate::models::{EventPage, SessionSummary, StoreStats};
use relay_core::Result;
use serde_json::Value;
use tracing::debug;

const SUMMARY_SELECT: &str = r#"
    SELECT s.session_id, s.user_id, s.metadata, s.is_active, s.created_at, s.updated_at,
           COALESCE(e.event_count, 0) AS event_count,
           COALESCE(r.error_count, 0) AS error_count
    FROM sessions s
    LEFT JOIN (
        SELECT session_id, SUM(event_count)::BIGINT AS event_count
        FROM session_events GROUP BY session_id
    ) e ON e.session_id = s.session_id
    LEFT JOIN (
        SELECT session_id, COUNT(*) AS error_count
        FROM session_errors GROUP BY session_id
    ) r ON r.session_id = s.session_id
"#;

/// Event-level pagination across batch rows.
///
/// Batch rows hold variable event counts, so the page is produced by reading
/// every row for the session in `(created_at, id)` order, concatenating the
/// arrays, and slicing `[from_index, from_index + limit)`. An unknown session
/// or an offset past the end of the stream yields an empty page, not an
/// error. Consistency is eventual with respect to in-flight batcher writes.
pub async fn session_events_page(
    store: &SessionStore,
    session_id: &str,
    from_index: usize,
    limit: usize,
) -> Result<EventPage> {
    let rows: Vec<(Value,)> = sqlx::query_as(
        "SELECT events FROM session_events WHERE session_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(session_id)
    .fetch_all(store.pool())
    .await
    .map_err(db_err)?;

    let mut stream: Vec<Value> = Vec::new();
    for (events,) in rows {
        if let Value::Array(batch) = events {
            stream.extend(batch);
        }
    }

    let total = stream.len();
    let events: Vec<Value> = stream
        .into_iter()
        .skip(from_index)
        .take(limit)
        .collect();

    debug!(
        session_id = session_id,
        from_index = from_index,
        returned = events.len(),
        total = total,
        "Paged session events"
    );

    Ok(EventPage { events, total })
}

/// Active sessions with counts, most recently updated first.
pub async fn active_sessions(store: &SessionStore) -> Result<Vec<SessionSummary>> {
    let sql = format!("{SUMMARY_SELECT} WHERE s.is_active = TRUE ORDER BY s.updated_at DESC");
    sqlx::query_as::<_, SessionSummary>(&sql)
        .fetch_all(store.pool())
        .await
        .map_err(db_err)
}

/// Full session index with counts, paginated.
pub async fn all_sessions(
    store: &SessionStore,
    limit: i64,
    offset: i64,
) -> Result<Vec<SessionSummary>> {
    let sql = format!("{SUMMARY_SELECT} ORDER BY s.updated_at DESC LIMIT $1 OFFSET $2");
    sqlx::query_as::<_, SessionSummary>(&sql)
        .bind(limit)
        .bind(offset)
        .fetch_all(store.pool())
        .await
        .map_err(db_err)
}

/// Aggregate totals.
pub async fn stats(store: &SessionStore) -> Result<StoreStats> {
    sqlx::query_as::<_, StoreStats>(
        r#"
        SELECT (SELECT COUNT(*) FROM sessions) AS total_sessions,
               (SELECT COUNT(*) FROM sessions WHERE is_active) AS active_sessions,
               (SELECT COALESCE(SUM(event_count), 0)::BIGINT FROM session_events) AS total_events
        "#,
    )
    .fetch_one(store.pool())
    .await
    .map_err(db_err)
}

/// Deletes inactive sessions older than `max_age_hours`.
///
/// Foreign keys cascade, removing the session's events and errors with it.
/// Returns the number of deleted sessions.
pub async fn cleanup_old_sessions(store: &SessionStore, max_age_hours: i32) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM sessions WHERE is_active = FALSE AND updated_at < now() - make_interval(hours => $1)",
    )
    .bind(max_age_hours)
    .execute(store.pool())
    .await
    .map_err(db_err)?;

    Ok(result.rows_affected())
}
