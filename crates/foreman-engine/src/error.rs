//! Error taxonomy for the orchestration engine.

use foreman_core::db::DatabaseError;
use thiserror::Error;

/// Result type alias using [`EngineError`].
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by engine operations.
///
/// Graph and claim conflicts are synchronous and never retried inside the
/// engine; retry policy belongs to the caller. Subprocess and timeout
/// failures are additionally surfaced to subscribers as `StreamError` events
/// before the session is force-ended.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed request: missing/ambiguous query key, self-loop dependency,
    /// empty prompt, terminal status where a live one is required.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operation lost to a concurrent writer or would violate an
    /// invariant (cycle insertion).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The session is mid-turn; the caller should enqueue instead.
    #[error("Session for run {run_id} is busy")]
    Busy { run_id: String },

    /// The session's first turn has not produced a resume token yet.
    #[error("Session for run {run_id} has no resume token yet")]
    NotReady { run_id: String },

    /// Unknown run, feature, job, or session.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Subprocess spawn failure or pool exhaustion.
    #[error("Subprocess error: {0}")]
    Subprocess(String),

    /// Inactivity timeout fired.
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] foreman_core::Error),
}
