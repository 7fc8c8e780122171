//! Outbox relay: moves committed outbox events onto the message bus.
//!
//! The [`Dispatcher`] drains pending events in lock-and-skip batches and
//! publishes them through a [`MessagePublisher`], normally the
//! [`HttpBroker`]. The [`Cleaner`] removes terminal rows past retention. Both
//! are wrapped as scheduler jobs by [`DispatchJob`] and [`CleanupJob`].
//!
//! On the receiving side, [`IdempotentConsumer`] guards a [`MessageHandler`]
//! with the idempotency ledger so redelivered messages apply their effects
//! once.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod cleaner;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod jobs;
pub mod publisher;
pub mod topic;

pub use broker::{BrokerConfig, ExchangeKind, HttpBroker};
pub use cleaner::{Cleaner, CleanerConfig, CleanupReport};
pub use consumer::{
    ConsumeOutcome, HandlerError, IdempotentConsumer, InboundMessage, MessageHandler,
};
pub use dispatcher::{DispatchStats, Dispatcher, DispatcherConfig};
pub use error::{ErrorCategory, PublishError, RelayError, Result};
pub use jobs::{CleanupJob, DispatchJob, CLEANUP_JOB, DISPATCH_JOB};
pub use publisher::{MessagePublisher, OutboundMessage};
pub use topic::topic_matches;
