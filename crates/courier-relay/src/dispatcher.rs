//! Outbox dispatcher: drains pending events to the message bus.
//!
//! One [`Dispatcher::dispatch`] call runs one batch inside one transaction:
//!
//! ```text
//! begin ─▶ find_pending_batch (FOR UPDATE SKIP LOCKED)
//!            │
//!            ├─▶ publish ok    ─▶ mark published ─▶ update_status
//!            ├─▶ publish error ─▶ increment retry ─▶ pending | failed
//!            ▼
//!          commit (releases every row lock of the batch)
//! ```
//!
//! A run bounded by [`Dispatcher::dispatch_within`] or a cancellation token
//! stops between events, or abandons an in-flight publish, and still commits
//! what it handled. The abandoned event keeps its row untouched and is
//! retried by a later batch.
//!
//! A failure on one event never aborts the batch. Only a failure to open the
//! transaction or fetch the batch is returned to the caller, which retries on
//! the next tick.

use std::{sync::Arc, time::Duration};

use courier_core::{BackoffTable, Clock, EventStore, OutboxEvent, RealClock};
use tokio::{sync::RwLock, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    error::{ErrorCategory, PublishError, Result},
    publisher::{MessagePublisher, OutboundMessage},
};

/// Default number of events fetched per dispatch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum events locked and published per run.
    pub batch_size: usize,

    /// Upper bound for a single publish; elapsing counts as a publish failure.
    pub publish_timeout: Duration,

    /// Advisory delays written to `next_retry_at`.
    pub backoff: BackoffTable,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            publish_timeout: Duration::from_secs(10),
            backoff: BackoffTable::default(),
        }
    }
}

/// Counters accumulated across dispatch runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Dispatch runs that fetched a batch.
    pub runs: u64,
    /// Events whose `published` status was persisted.
    pub published: u64,
    /// Failed publishes that left the event pending for another attempt.
    pub retried: u64,
    /// Events moved to `failed` after exhausting retries.
    pub failed: u64,
    /// Status updates that could not be persisted.
    pub persistence_failures: u64,
}

/// What happened to one event of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventOutcome {
    Published,
    Retrying,
    Failed,
    PersistenceFailed,
}

/// Moves pending outbox events onto the message bus.
pub struct Dispatcher<S, P> {
    store: Arc<S>,
    publisher: P,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    stats: Arc<RwLock<DispatchStats>>,
}

impl<S, P> Dispatcher<S, P>
where
    S: EventStore,
    P: MessagePublisher,
{
    /// Creates a dispatcher reading wall-clock time from the system.
    pub fn new(store: Arc<S>, publisher: P, config: DispatcherConfig) -> Self {
        Self::with_clock(store, publisher, config, Arc::new(RealClock::new()))
    }

    /// Creates a dispatcher with an explicit clock.
    pub fn with_clock(
        store: Arc<S>,
        publisher: P,
        config: DispatcherConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let stats = Arc::new(RwLock::new(DispatchStats::default()));
        Self { store, publisher, clock, config, stats }
    }

    /// Dispatcher configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Snapshot of the accumulated counters.
    pub async fn stats(&self) -> DispatchStats {
        self.stats.read().await.clone()
    }

    /// Publishes one batch of pending events.
    ///
    /// Returns the number of events whose `published` status was persisted.
    /// An empty outbox returns `Ok(0)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot be opened, the batch cannot
    /// be fetched, or the final commit fails. Per-event failures are logged
    /// and never returned.
    pub async fn dispatch(&self) -> Result<usize> {
        self.dispatch_until_cancelled(&CancellationToken::new()).await
    }

    /// Like [`Dispatcher::dispatch`], but stops taking new events from the
    /// batch once `cancel` fires.
    ///
    /// Events already handled are still committed; untouched rows are
    /// released and stay pending.
    ///
    /// # Errors
    ///
    /// Same as [`Dispatcher::dispatch`].
    pub async fn dispatch_until_cancelled(&self, cancel: &CancellationToken) -> Result<usize> {
        let span = info_span!("outbox_dispatch", batch_size = self.config.batch_size);
        self.run_batch(cancel, None).instrument(span).await
    }

    /// Like [`Dispatcher::dispatch_until_cancelled`], but also stops once
    /// `budget` has elapsed.
    ///
    /// A publish still in flight at the deadline is abandoned and its event
    /// left pending, so the commit of everything handled before it is never
    /// lost to a caller-side timeout.
    ///
    /// # Errors
    ///
    /// Same as [`Dispatcher::dispatch`].
    pub async fn dispatch_within(
        &self,
        cancel: &CancellationToken,
        budget: Duration,
    ) -> Result<usize> {
        let span = info_span!(
            "outbox_dispatch",
            batch_size = self.config.batch_size,
            budget_ms = budget.as_millis() as u64
        );
        self.run_batch(cancel, Some(Instant::now() + budget)).instrument(span).await
    }

    async fn run_batch(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<usize> {
        let started = self.clock.now();
        let mut tx = self.store.begin().await?;

        let batch = match self.store.find_pending_batch(&mut tx, self.config.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "failed to fetch pending batch");
                if let Err(rollback_err) = self.store.rollback(tx).await {
                    warn!(error = %rollback_err, "rollback after failed fetch also failed");
                }
                return Err(e.into());
            },
        };

        if batch.is_empty() {
            self.store.commit(tx).await?;
            debug!("no pending events");
            return Ok(0);
        }

        let fetched = batch.len();
        let mut tally = DispatchStats { runs: 1, ..DispatchStats::default() };
        let mut handled = 0usize;

        for mut event in batch {
            if cancel.is_cancelled() || deadline.is_some_and(|at| Instant::now() >= at) {
                let remaining = fetched - handled;
                info!(handled, remaining, "dispatch interrupted, releasing rest");
                break;
            }

            // Only the publish is raced; a status update is never abandoned halfway.
            let published = tokio::select! {
                result = self.publish(&event) => Some(result),
                () = cancel.cancelled() => None,
                () = deadline_reached(deadline) => None,
            };
            let Some(published) = published else {
                info!(
                    event_id = %event.id,
                    handled,
                    remaining = fetched - handled,
                    "publish abandoned at dispatch deadline, event stays pending"
                );
                break;
            };

            let outcome = match published {
                Ok(()) => self.record_success(&mut tx, &mut event).await,
                Err(e) => self.record_failure(&mut tx, &mut event, &e).await,
            };
            match outcome {
                EventOutcome::Published => tally.published += 1,
                EventOutcome::Retrying => tally.retried += 1,
                EventOutcome::Failed => tally.failed += 1,
                EventOutcome::PersistenceFailed => tally.persistence_failures += 1,
            }
            handled += 1;
        }

        // Commit even after per-event failures so the successful updates stick.
        self.store.commit(tx).await?;

        let duration_ms = self.clock.now().saturating_duration_since(started).as_millis() as u64;
        info!(
            fetched,
            published = tally.published,
            retried = tally.retried,
            failed = tally.failed,
            persistence_failures = tally.persistence_failures,
            duration_ms,
            "dispatch completed"
        );

        let published = tally.published as usize;
        self.record(tally).await;
        Ok(published)
    }

    async fn publish(&self, event: &OutboxEvent) -> std::result::Result<(), PublishError> {
        let message = OutboundMessage::from_event(event)?;
        let timeout = self.config.publish_timeout;

        match tokio::time::timeout(timeout, self.publisher.publish(message)).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::timeout(timeout.as_millis() as u64)),
        }
    }

    async fn record_success(&self, tx: &mut S::Tx, event: &mut OutboxEvent) -> EventOutcome {
        if let Err(e) = event.mark_as_published(self.clock.now_utc()) {
            error!(event_id = %event.id, error = %e, "published event could not be marked");
            return EventOutcome::PersistenceFailed;
        }

        match self.store.update_status(tx, event).await {
            Ok(()) => {
                debug!(event_id = %event.id, routing_key = %event.routing_key(), "event published");
                EventOutcome::Published
            },
            Err(e) => {
                // The bus has the message but the row still says pending; the
                // next batch publishes it again.
                event.mark_as_pending();
                error!(
                    event_id = %event.id,
                    error = %e,
                    "published event status not persisted, will be republished"
                );
                EventOutcome::PersistenceFailed
            },
        }
    }

    async fn record_failure(
        &self,
        tx: &mut S::Tx,
        event: &mut OutboxEvent,
        publish_error: &PublishError,
    ) -> EventOutcome {
        let now = self.clock.now_utc();
        let category = ErrorCategory::from(publish_error);

        let outcome = match event.increment_retry(now, &self.config.backoff) {
            Ok(()) if event.can_retry() => {
                event.mark_as_pending();
                warn!(
                    event_id = %event.id,
                    retry_count = event.retry_count,
                    next_retry_at = ?event.next_retry_at,
                    error_category = %category,
                    error = %publish_error,
                    "publish failed, will retry"
                );
                EventOutcome::Retrying
            },
            Ok(()) | Err(_) => match event.mark_as_failed(now) {
                Ok(()) => {
                    error!(
                        event_id = %event.id,
                        retry_count = event.retry_count,
                        error_category = %category,
                        error = %publish_error,
                        "publish retries exhausted, event failed"
                    );
                    EventOutcome::Failed
                },
                Err(e) => {
                    error!(event_id = %event.id, error = %e, "failed event could not be marked");
                    return EventOutcome::PersistenceFailed;
                },
            },
        };

        match self.store.update_status(tx, event).await {
            Ok(()) => outcome,
            Err(e) => {
                error!(event_id = %event.id, error = %e, "failed to persist retry state");
                EventOutcome::PersistenceFailed
            },
        }
    }

    async fn record(&self, tally: DispatchStats) {
        let mut stats = self.stats.write().await;
        stats.runs += tally.runs;
        stats.published += tally.published;
        stats.retried += tally.retried;
        stats.failed += tally.failed;
        stats.persistence_failures += tally.persistence_failures;
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
