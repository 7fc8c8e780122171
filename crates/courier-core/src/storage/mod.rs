//! PostgreSQL access layer for the outbox.
//!
//! Repositories own all SQL touching `outbox_events` and `processed_events`.
//! [`PostgresStore`] adapts them to the [`EventStore`] and
//! [`IdempotencyLedger`] ports used by the relay.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

pub mod outbox_events;
pub mod processed_events;
pub mod schema;

use crate::{
    error::Result,
    models::{EventId, EventStatus, OutboxEvent},
    store::{BoxFuture, EventStore, IdempotencyLedger, Transactional},
};

/// Container for all repository instances sharing one pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for outbox events.
    pub outbox_events: Arc<outbox_events::Repository>,

    /// Repository for the idempotency ledger.
    pub processed_events: Arc<processed_events::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            outbox_events: Arc::new(outbox_events::Repository::new(pool.clone())),
            processed_events: Arc::new(processed_events::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates tables and indexes if missing.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if a DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        schema::migrate(&self.pool).await
    }

    /// Verifies database connectivity with a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}

/// PostgreSQL implementation of the outbox persistence ports.
#[derive(Clone)]
pub struct PostgresStore {
    storage: Storage,
}

impl PostgresStore {
    /// Wraps a storage container.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Builds the store directly from a pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self::new(Storage::new(pool))
    }

    /// Underlying repositories.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

impl Transactional for PostgresStore {
    type Tx = Transaction<'static, Postgres>;

    fn begin(&self) -> BoxFuture<'_, Result<Self::Tx>> {
        Box::pin(async move { Ok(self.storage.pool.begin().await?) })
    }

    fn commit(&self, tx: Self::Tx) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { Ok(tx.commit().await?) })
    }

    fn rollback(&self, tx: Self::Tx) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { Ok(tx.rollback().await?) })
    }
}

impl EventStore for PostgresStore {
    fn save<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        event: &'a OutboxEvent,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.storage.outbox_events.insert_in_tx(tx, event))
    }

    fn find_pending_batch<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<OutboxEvent>>> {
        Box::pin(self.storage.outbox_events.find_pending_batch_in_tx(tx, limit))
    }

    fn update_status<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        event: &'a OutboxEvent,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.storage.outbox_events.update_status_in_tx(tx, event))
    }

    fn delete_published_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.storage.outbox_events.delete_published_before(cutoff))
    }

    fn delete_failed_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.storage.outbox_events.delete_failed_before(cutoff))
    }

    fn count_published_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.storage.outbox_events.count_published_before(cutoff))
    }

    fn count_failed_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.storage.outbox_events.count_failed_before(cutoff))
    }

    fn find_by_id(&self, id: EventId) -> BoxFuture<'_, Result<Option<OutboxEvent>>> {
        Box::pin(self.storage.outbox_events.find_by_id(id))
    }

    fn count_by_status(&self, status: EventStatus) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.storage.outbox_events.count_by_status(status))
    }

    fn requeue_failed(&self, id: EventId) -> BoxFuture<'_, Result<bool>> {
        Box::pin(self.storage.outbox_events.requeue_failed(id))
    }
}

impl IdempotencyLedger for PostgresStore {
    fn is_processed<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        event_id: EventId,
        consumer_name: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.storage.processed_events.is_processed_in_tx(tx, event_id, consumer_name))
    }

    fn mark_as_processed<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        event_id: EventId,
        consumer_name: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.storage.processed_events.mark_processed_in_tx(tx, event_id, consumer_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_lazily() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://localhost/courier").unwrap();
        let store = PostgresStore::from_pool(pool);
        assert_eq!(store.storage().pool().size(), 0);
    }
}
