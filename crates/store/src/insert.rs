//! Transactional batch application.

use crate::client::{db_err, SessionStore};
use relay_core::{Result, SessionBatch};
use serde_json::Value;
use tracing::debug;

/// Applies a drained run of batches inside a single transaction.
///
/// Per batch, in order: upsert the session row, append one events row when
/// the batch carries events, append one row per error. Any failure rolls the
/// whole run back so the caller can re-queue it without partial writes.
pub async fn apply_batches(store: &SessionStore, batches: &[SessionBatch]) -> Result<()> {
    if batches.is_empty() {
        return Ok(());
    }

    let mut tx = store.pool().begin().await.map_err(db_err)?;

    for batch in batches {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, user_id, metadata, is_active)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (session_id) DO UPDATE
            SET user_id = EXCLUDED.user_id,
                metadata = EXCLUDED.metadata,
                is_active = EXCLUDED.is_active,
                updated_at = now()
            "#,
        )
        .bind(&batch.session_id)
        .bind(&batch.user_id)
        .bind(&batch.metadata)
        .bind(batch.is_active)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if !batch.events.is_empty() {
            sqlx::query(
                "INSERT INTO session_events (session_id, events, event_count) VALUES ($1, $2, $3)",
            )
            .bind(&batch.session_id)
            .bind(Value::Array(batch.events.clone()))
            .bind(batch.events.len() as i32)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for error in &batch.errors {
            sqlx::query("INSERT INTO session_errors (session_id, error_data) VALUES ($1, $2)")
                .bind(&batch.session_id)
                .bind(error)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
    }

    tx.commit().await.map_err(db_err)?;

    debug!(batches = batches.len(), "Applied batch transaction");
    Ok(())
}
