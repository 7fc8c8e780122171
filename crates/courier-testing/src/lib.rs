//! Test infrastructure for the outbox relay.
//!
//! [`TestEnv`] wires the dispatcher and cleaner to an in-memory store, a
//! [`RecordingPublisher`] and a [`TestClock`], so relay scenarios run without
//! external services. [`TestDatabase`] provides isolated PostgreSQL databases
//! for the storage tests that need the real lock-and-skip query.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use courier_core::{EventId, EventStore, InMemoryStore, OutboxEvent, Transactional};
use courier_relay::{Cleaner, CleanerConfig, Dispatcher, DispatcherConfig};

pub mod database;
pub mod fixtures;
pub mod invariants;
pub mod publisher;

pub use courier_core::TestClock;
pub use database::TestDatabase;
pub use fixtures::{pending_events, OutboxEventBuilder};
pub use invariants::Invariants;
pub use publisher::{FailureKind, RecordingPublisher};

/// Dispatcher type produced by [`TestEnv`].
pub type TestDispatcher = Dispatcher<InMemoryStore, Arc<RecordingPublisher>>;

/// In-memory relay environment with deterministic time.
pub struct TestEnv {
    /// Outbox and ledger storage.
    pub store: Arc<InMemoryStore>,
    /// Message bus double.
    pub publisher: Arc<RecordingPublisher>,
    /// Clock shared with every component built from this environment.
    pub clock: TestClock,
}

impl TestEnv {
    /// Creates an environment starting at 2024-01-01T00:00:00Z.
    pub fn new() -> Self {
        Self::starting_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default())
    }

    /// Creates an environment whose clock starts at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            publisher: Arc::new(RecordingPublisher::new()),
            clock: TestClock::with_start_time(start),
        }
    }

    /// Dispatcher with default settings.
    pub fn dispatcher(&self) -> TestDispatcher {
        self.dispatcher_with(DispatcherConfig::default())
    }

    /// Dispatcher with custom settings.
    pub fn dispatcher_with(&self, config: DispatcherConfig) -> TestDispatcher {
        Dispatcher::with_clock(
            self.store.clone(),
            self.publisher.clone(),
            config,
            Arc::new(self.clock.clone()),
        )
    }

    /// Cleaner with custom settings.
    pub fn cleaner(&self, config: CleanerConfig) -> Cleaner<InMemoryStore> {
        Cleaner::with_clock(self.store.clone(), config, Arc::new(self.clock.clone()))
    }

    /// Saves `event` in its own committed transaction.
    pub async fn save(&self, event: &OutboxEvent) -> Result<()> {
        let mut tx = self.store.begin().await?;
        self.store.save(&mut tx, event).await?;
        self.store.commit(tx).await?;
        Ok(())
    }

    /// Saves each event, returning their ids in order.
    pub async fn save_all(&self, events: &[OutboxEvent]) -> Result<Vec<EventId>> {
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            self.save(event).await?;
            ids.push(event.id);
        }
        Ok(ids)
    }

    /// Current committed state of one event.
    pub async fn event(&self, id: EventId) -> Result<OutboxEvent> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("event {id} not found"))
    }

    /// Checks every outbox invariant over the committed rows.
    pub fn assert_invariants(&self) -> Result<()> {
        Invariants::check_all(&self.store.events())
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
