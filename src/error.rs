//! Error types shared across the session lifecycle engine.
//!
//! Each module that can fail in a way callers must match on gets its own
//! enum here (or beside it); the orchestration layer (poller, push
//! processor, runtime) collapses everything into `anyhow::Error` once only
//! logging/propagation is left to do.

use thiserror::Error;

/// Errors surfaced by the [`crate::store::SessionStore`] trait.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no live session for server={server_id} key={session_key}")]
    NotFound {
        server_id: uuid::Uuid,
        session_key: String,
    },
    #[error("session {0} not found")]
    SessionNotFound(uuid::Uuid),
    #[error("server user {0} not found")]
    ServerUserNotFound(uuid::Uuid),
    #[error("serialization failure, retry the transaction")]
    SerializationFailure,
    #[error("statement timed out")]
    StatementTimeout,
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the [`crate::cache::CacheBackend`] trait.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("lock not acquired for {0}")]
    LockNotAcquired(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by [`crate::lifecycle`] entry points.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("transaction retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.code().as_deref() {
                Some("40001") => return StoreError::SerializationFailure,
                Some("57014") => return StoreError::StatementTimeout,
                _ => {}
            }
        }
        StoreError::Backend(err.to_string())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}
