//! Error types and result handling for outbox persistence.
//!
//! Separates infrastructure failures (database, missing rows) from domain
//! rule violations (invalid events, refused state transitions) so callers can
//! decide whether to log and continue or to abort a whole batch.

use thiserror::Error;

use crate::models::{EventId, EventStatus};

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for outbox operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input rejected before reaching storage.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Retry budget already spent for this event.
    #[error("event {event_id} already retried {retry_count} times")]
    RetriesExhausted {
        /// Event that was asked to retry again.
        event_id: EventId,
        /// Retry count at the time of refusal.
        retry_count: i32,
    },

    /// Requested status change is not allowed from the current status.
    #[error("event {event_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Event the transition was attempted on.
        event_id: EventId,
        /// Current status.
        from: EventStatus,
        /// Requested status.
        to: EventStatus,
    },
}

impl CoreError {
    /// Creates a not-found error for an outbox event.
    pub fn event_not_found(event_id: EventId) -> Self {
        Self::NotFound(format!("outbox event {event_id}"))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(format!("payload serialization failed: {err}"))
    }
}
