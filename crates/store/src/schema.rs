//! Schema definition, applied at startup.
//!
//! Three tables. `metadata`, `events`, and `error_data` are JSONB: the relay
//! treats payloads as opaque and never queries into them. Event rows hold
//! whole batches; deleting a session cascades to its events and errors.

use crate::client::{db_err, SessionStore};
use relay_core::Result;
use tracing::info;

const DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        session_id  TEXT PRIMARY KEY,
        user_id     TEXT NOT NULL,
        metadata    JSONB NOT NULL DEFAULT '{}'::jsonb,
        is_active   BOOLEAN NOT NULL DEFAULT TRUE,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS session_events (
        id          BIGSERIAL PRIMARY KEY,
        session_id  TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
        events      JSONB NOT NULL,
        event_count INTEGER NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS session_errors (
        id          BIGSERIAL PRIMARY KEY,
        session_id  TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
        error_data  JSONB NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_created_at ON sessions(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_session_events_session_id ON session_events(session_id)",
    "CREATE INDEX IF NOT EXISTS idx_session_events_created_at ON session_events(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_session_errors_session_id ON session_errors(session_id)",
];

/// Creates tables and indexes if they do not exist.
pub async fn init_schema(store: &SessionStore) -> Result<()> {
    for ddl in DDL {
        sqlx::query(ddl)
            .execute(store.pool())
            .await
            .map_err(db_err)?;
    }

    info!("Store schema initialized");
    Ok(())
}
