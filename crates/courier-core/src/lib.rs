//! Core outbox model, persistence ports and storage adapters.
//!
//! Defines the outbox event record and its delivery state machine, the
//! persistence ports used by the relay (event store and idempotency ledger),
//! and their PostgreSQL and in-memory implementations. All other crates depend
//! on these types for consistent status handling and error reporting.
//!
//! # Transactional outbox
//!
//! Business code appends an [`OutboxEvent`] with [`EventStore::save`] inside
//! the same transaction as its own writes. The relay later drains pending
//! events with lock-and-skip reads, so any number of dispatcher processes can
//! share one table without publishing the same row twice concurrently.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod memory;
pub mod models;
pub mod retry;
pub mod storage;
pub mod store;
pub mod time;

pub use error::{CoreError, Result};
pub use memory::{InMemoryStore, MemoryTx};
pub use models::{AggregateId, EventId, EventStatus, OutboxEvent, ProcessedEvent, MAX_RETRIES};
pub use retry::BackoffTable;
pub use storage::{PostgresStore, Storage};
pub use store::{BoxFuture, EventStore, IdempotencyLedger, Transactional};
pub use time::{Clock, RealClock, TestClock};
