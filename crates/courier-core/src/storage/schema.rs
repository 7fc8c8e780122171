//! Idempotent schema setup for the outbox and the idempotency ledger.

use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS outbox_events (
        id UUID PRIMARY KEY,
        aggregate_id UUID NOT NULL,
        aggregate_type TEXT NOT NULL,
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'published', 'failed')),
        retry_count INTEGER NOT NULL DEFAULT 0
            CHECK (retry_count BETWEEN 0 AND 3),
        next_retry_at TIMESTAMPTZ,
        published_at TIMESTAMPTZ,
        failed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT outbox_events_terminal_exclusive
            CHECK (published_at IS NULL OR failed_at IS NULL),
        CONSTRAINT outbox_events_payload_not_empty
            CHECK (payload <> '{}'::jsonb)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_events_pending
    ON outbox_events(created_at)
    WHERE status = 'pending'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_events_published_at
    ON outbox_events(published_at)
    WHERE status = 'published'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbox_events_failed_at
    ON outbox_events(failed_at)
    WHERE status = 'failed'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS processed_events (
        event_id UUID NOT NULL,
        consumer_name TEXT NOT NULL,
        processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_processed_events_event_consumer
    ON processed_events(event_id, consumer_name)
    "#,
];

/// Creates the outbox tables and indexes if they do not exist yet.
///
/// # Errors
///
/// Returns `CoreError::Database` if any statement fails.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!(statements = STATEMENTS.len(), "outbox schema ensured");
    Ok(())
}
