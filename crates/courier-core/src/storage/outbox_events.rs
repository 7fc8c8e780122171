//! Repository for outbox event database operations.
//!
//! Appends happen inside the caller's business transaction; the dispatcher
//! reads and updates rows inside its own batch transaction; deletion is a
//! pool-level sweep run by the cleaner.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Connection, Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{EventId, EventStatus, OutboxEvent},
};

const EVENT_COLUMNS: &str = "id, aggregate_id, aggregate_type, event_type, payload, status, \
                             retry_count, next_retry_at, published_at, failed_at, created_at";

/// Repository for the `outbox_events` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Appends an event within the caller's transaction.
    ///
    /// The event is validated first; nothing is written for an invalid
    /// record.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for invalid events and
    /// `CoreError::ConstraintViolation` if the id already exists.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> Result<()> {
        self.insert_impl(&mut **tx, event).await
    }

    /// Appends an event in its own implicit transaction.
    ///
    /// Only for fixtures and tooling: business code must use
    /// [`Repository::insert_in_tx`] so the event commits with its write.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::insert_in_tx`].
    pub async fn insert(&self, event: &OutboxEvent) -> Result<()> {
        self.insert_impl(&*self.pool, event).await
    }

    async fn insert_impl<'e, E>(&self, executor: E, event: &OutboxEvent) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        event.validate()?;

        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id, aggregate_id, aggregate_type, event_type, payload, status,
                retry_count, next_retry_at, published_at, failed_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.id)
        .bind(event.aggregate_id)
        .bind(&event.aggregate_type)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.status)
        .bind(event.retry_count)
        .bind(event.next_retry_at)
        .bind(event.published_at)
        .bind(event.failed_at)
        .bind(event.created_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Selects and locks up to `limit` pending events, oldest first.
    ///
    /// `FOR UPDATE SKIP LOCKED` hands each concurrent dispatcher a disjoint
    /// set of rows without blocking. Locks are held until `tx` ends.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_pending_batch_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let events = sqlx::query_as::<_, OutboxEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events \
             WHERE status = 'pending' \
             ORDER BY created_at ASC \
             LIMIT $1 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(limit)
        .fetch_all(&mut **tx)
        .await?;

        Ok(events)
    }

    /// Persists status and retry bookkeeping under a savepoint.
    ///
    /// A failed update rolls back to the savepoint, so the enclosing batch
    /// transaction stays usable for the remaining events.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the row no longer exists.
    pub async fn update_status_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> Result<()> {
        let mut savepoint = Connection::begin(&mut **tx).await?;

        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = $2, retry_count = $3, next_retry_at = $4,
                published_at = $5, failed_at = $6
            WHERE id = $1
            "#,
        )
        .bind(event.id)
        .bind(event.status)
        .bind(event.retry_count)
        .bind(event.next_retry_at)
        .bind(event.published_at)
        .bind(event.failed_at)
        .execute(&mut *savepoint)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                savepoint.rollback().await?;
                Err(CoreError::event_not_found(event.id))
            },
            Ok(_) => {
                savepoint.commit().await?;
                Ok(())
            },
            Err(e) => {
                savepoint.rollback().await?;
                Err(e.into())
            },
        }
    }

    /// Finds an event by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: EventId) -> Result<Option<OutboxEvent>> {
        let event = sqlx::query_as::<_, OutboxEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Counts events in the given status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(&self, status: EventStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events WHERE status = $1")
            .bind(status)
            .fetch_one(&*self.pool)
            .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Deletes published events older than `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox_events WHERE status = 'published' AND published_at < $1",
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Deletes failed events older than `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_failed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM outbox_events WHERE status = 'failed' AND failed_at < $1")
                .bind(cutoff)
                .execute(&*self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    /// Counts published events older than `cutoff` without deleting them.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM outbox_events WHERE status = 'published' AND published_at < $1",
        )
        .bind(cutoff)
        .fetch_one(&*self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Counts failed events older than `cutoff` without deleting them.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_failed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM outbox_events WHERE status = 'failed' AND failed_at < $1",
        )
        .bind(cutoff)
        .fetch_one(&*self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Resets a failed event to pending with a fresh retry budget.
    ///
    /// Returns false if the event is missing or not in `failed`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn requeue_failed(&self, id: EventId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending', retry_count = 0, next_retry_at = NULL,
                published_at = NULL, failed_at = NULL
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
