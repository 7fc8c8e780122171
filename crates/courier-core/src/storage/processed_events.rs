//! Repository for the idempotency ledger.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{EventId, ProcessedEvent},
};

/// Repository for the `processed_events` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Checks whether `consumer_name` already applied `event_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn is_processed_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: EventId,
        consumer_name: &str,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM processed_events
                WHERE event_id = $1 AND consumer_name = $2
            )
            "#,
        )
        .bind(event_id)
        .bind(consumer_name)
        .fetch_one(&mut **tx)
        .await?;

        Ok(exists)
    }

    /// Records the pair, ignoring duplicates.
    ///
    /// Returns true if this call inserted the row. Under concurrent inserts
    /// the unique index makes exactly one caller win.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails for any reason other than a
    /// duplicate.
    pub async fn mark_processed_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: EventId,
        consumer_name: &str,
    ) -> Result<bool> {
        self.mark_processed_impl(&mut **tx, event_id, consumer_name).await
    }

    async fn mark_processed_impl<'e, E>(
        &self,
        executor: E,
        event_id: EventId,
        consumer_name: &str,
    ) -> Result<bool>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, consumer_name, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (event_id, consumer_name) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(consumer_name)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Lists every consumer that applied `event_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_event(&self, event_id: EventId) -> Result<Vec<ProcessedEvent>> {
        let rows = sqlx::query_as::<_, ProcessedEvent>(
            r#"
            SELECT event_id, consumer_name, processed_at
            FROM processed_events
            WHERE event_id = $1
            ORDER BY processed_at ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }
}
