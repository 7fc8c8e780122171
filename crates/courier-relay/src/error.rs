//! Error types for publishing, dispatching and consuming outbox events.
//!
//! Publish failures are categorized so logs can tell a broker outage from a
//! routing mistake; the dispatcher retries every category the same way.

use std::fmt;

use courier_core::CoreError;
use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors surfaced by the dispatcher, cleaner and consumer.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Persistence layer failed.
    #[error(transparent)]
    Storage(#[from] CoreError),

    /// Message bus rejected or never received a message.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Inbound message is malformed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Consumer handler failed; its transaction was rolled back.
    #[error("handler {consumer} failed: {message}")]
    Handler {
        /// Consumer whose handler failed.
        consumer: String,
        /// Handler error message.
        message: String,
    },

    /// Invalid relay configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Failure to hand a message to the bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// Broker could not be reached.
    #[error("broker connection failed: {message}")]
    Network {
        /// Underlying transport error.
        message: String,
    },

    /// Publish did not complete in time.
    #[error("publish timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// Broker refused the request (4xx).
    #[error("broker rejected publish: HTTP {status_code}")]
    Rejected {
        /// HTTP status code.
        status_code: u16,
        /// Response body.
        body: String,
    },

    /// Broker failed internally (5xx).
    #[error("broker error: HTTP {status_code}")]
    Broker {
        /// HTTP status code.
        status_code: u16,
        /// Response body.
        body: String,
    },

    /// Exchange accepted the message but no queue was bound for it.
    #[error("message with routing key {routing_key} was not routed to any queue")]
    Unroutable {
        /// Routing key of the dropped message.
        routing_key: String,
    },

    /// Message could not be encoded.
    #[error("message serialization failed: {0}")]
    Serialization(String),

    /// Publisher is misconfigured.
    #[error("publisher configuration error: {0}")]
    Configuration(String),
}

impl PublishError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates an error from a non-success HTTP status.
    pub fn from_status(status_code: u16, body: impl Into<String>) -> Self {
        if (400..500).contains(&status_code) {
            Self::Rejected { status_code, body: body.into() }
        } else {
            Self::Broker { status_code, body: body.into() }
        }
    }

    /// Returns true for failures likely to clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. } | Self::Broker { .. })
    }
}

/// Category of a publish failure, for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connectivity or timeout.
    Network,
    /// Broker rejected or failed the request.
    Broker,
    /// Message had nowhere to go.
    Routing,
    /// Payload could not be encoded.
    Serialization,
    /// Local misconfiguration.
    Configuration,
}

impl From<&PublishError> for ErrorCategory {
    fn from(error: &PublishError) -> Self {
        match error {
            PublishError::Network { .. } | PublishError::Timeout { .. } => Self::Network,
            PublishError::Rejected { .. } | PublishError::Broker { .. } => Self::Broker,
            PublishError::Unroutable { .. } => Self::Routing,
            PublishError::Serialization(_) => Self::Serialization,
            PublishError::Configuration(_) => Self::Configuration,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Broker => write!(f, "broker"),
            Self::Routing => write!(f, "routing"),
            Self::Serialization => write!(f, "serialization"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}
