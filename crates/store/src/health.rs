//! Store connectivity probe.

use crate::client::SessionStore;

/// True when a round trip to Postgres succeeds.
pub async fn check_connection(store: &SessionStore) -> bool {
    sqlx::query("SELECT 1").execute(store.pool()).await.is_ok()
}
