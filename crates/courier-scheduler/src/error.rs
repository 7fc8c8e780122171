//! Error types for job registration and scheduler lifecycle.

use thiserror::Error;

/// Result type alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors reported by the scheduler itself, never by job bodies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Schedule expression could not be parsed.
    #[error("invalid schedule {expression:?}: {reason}")]
    InvalidSchedule {
        /// Expression as given at registration.
        expression: String,
        /// Parser explanation.
        reason: String,
    },

    /// A job with the same name is already registered.
    #[error("job {0:?} is already registered")]
    DuplicateJob(String),

    /// No job with this name is registered.
    #[error("unknown job {0:?}")]
    UnknownJob(String),

    /// `start` was called twice.
    #[error("scheduler already started")]
    AlreadyStarted,

    /// Shutdown deadline elapsed with runs still in flight.
    #[error("shutdown deadline elapsed with {running} job run(s) still in flight")]
    ShutdownTimeout {
        /// Runs that had not finished when the deadline elapsed.
        running: usize,
    },
}

impl SchedulerError {
    /// Creates an invalid schedule error.
    pub fn invalid_schedule(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchedule { expression: expression.into(), reason: reason.into() }
    }
}
