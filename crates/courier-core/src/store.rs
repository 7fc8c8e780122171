//! Persistence ports for the outbox and the idempotency ledger.
//!
//! The relay is generic over these traits so the same dispatcher, cleaner and
//! consumer run against PostgreSQL in production and against
//! [`InMemoryStore`](crate::memory::InMemoryStore) in tests. Every operation
//! that must share a business transaction takes the adapter's `Tx` handle
//! explicitly instead of opening its own.

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    models::{EventId, EventStatus, OutboxEvent},
};

/// Boxed future returned by the persistence traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Storage that can open and finish transactions.
///
/// Dropping a `Tx` without committing must roll it back.
pub trait Transactional: Send + Sync {
    /// Transaction handle threaded through the other operations.
    type Tx: Send + 'static;

    /// Opens a transaction.
    fn begin(&self) -> BoxFuture<'_, Result<Self::Tx>>;

    /// Commits all work done in `tx`.
    fn commit(&self, tx: Self::Tx) -> BoxFuture<'_, Result<()>>;

    /// Discards all work done in `tx` and releases its row locks.
    fn rollback(&self, tx: Self::Tx) -> BoxFuture<'_, Result<()>>;
}

/// Durable home of outbox events.
pub trait EventStore: Transactional {
    /// Appends a new event inside the caller's business transaction.
    ///
    /// The event becomes visible to dispatchers only when `tx` commits.
    fn save<'a>(&'a self, tx: &'a mut Self::Tx, event: &'a OutboxEvent)
        -> BoxFuture<'a, Result<()>>;

    /// Selects up to `limit` pending events, oldest first, locking each row
    /// for the lifetime of `tx`.
    ///
    /// Rows already locked by another transaction are skipped rather than
    /// waited on. `next_retry_at` is not consulted.
    fn find_pending_batch<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<OutboxEvent>>>;

    /// Persists the mutable fields of `event` within `tx`.
    ///
    /// A failure leaves `tx` usable for the remaining events of the batch.
    fn update_status<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        event: &'a OutboxEvent,
    ) -> BoxFuture<'a, Result<()>>;

    /// Deletes published events with `published_at` strictly before `cutoff`.
    fn delete_published_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>>;

    /// Deletes failed events with `failed_at` strictly before `cutoff`.
    fn delete_failed_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>>;

    /// Counts what [`EventStore::delete_published_before`] would remove.
    fn count_published_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>>;

    /// Counts what [`EventStore::delete_failed_before`] would remove.
    fn count_failed_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>>;

    /// Loads a single event outside any transaction.
    fn find_by_id(&self, id: EventId) -> BoxFuture<'_, Result<Option<OutboxEvent>>>;

    /// Counts events currently in `status`.
    fn count_by_status(&self, status: EventStatus) -> BoxFuture<'_, Result<u64>>;

    /// Operator action: resets a failed event to pending with a fresh retry
    /// budget. Returns false if the event is missing or not failed.
    fn requeue_failed(&self, id: EventId) -> BoxFuture<'_, Result<bool>>;
}

/// Record of which consumer already applied which event.
pub trait IdempotencyLedger: Transactional {
    /// Returns true if `consumer_name` has recorded `event_id`.
    fn is_processed<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        event_id: EventId,
        consumer_name: &'a str,
    ) -> BoxFuture<'a, Result<bool>>;

    /// Records `(event_id, consumer_name)` in the same transaction as the
    /// consumer's side effects.
    ///
    /// Returns false when the pair already exists, which means a concurrent
    /// delivery won the race and `tx` must be rolled back.
    fn mark_as_processed<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        event_id: EventId,
        consumer_name: &'a str,
    ) -> BoxFuture<'a, Result<bool>>;
}
