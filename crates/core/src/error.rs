//! Unified error types for the replay relay.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the replay relay.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame or payload from a client. The connection stays open;
    /// the client gets an `error` reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A well-formed message that cannot be routed: unknown session,
    /// or a message sent by the wrong client role.
    #[error("routing error: {0}")]
    Routing(String),

    /// Events or errors targeting a session that has already ended.
    #[error("session is no longer active: {0}")]
    SessionInactive(String),

    /// Durable store failure. Batches are re-queued; HTTP callers see a 5xx.
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing(msg.into())
    }

    pub fn session_inactive(session_id: impl Into<String>) -> Self {
        Self::SessionInactive(session_id.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Get the HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Protocol(_) => 400,
            Self::Routing(_) => 404,
            Self::SessionInactive(_) => 409,
            Self::Database(_) => 500,
            Self::Serialization(_) => 400,
            Self::Config(_) => 500,
            Self::Internal(_) => 500,
        }
    }
}
