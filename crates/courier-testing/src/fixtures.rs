//! Builders for outbox events in arbitrary states.
//!
//! The builder writes fields directly instead of walking the state machine,
//! so tests can seed aged or terminal rows in one line.

use chrono::{DateTime, Duration, Utc};
use courier_core::{AggregateId, EventId, EventStatus, OutboxEvent};
use rand::Rng;
use serde_json::{json, Map, Value};

/// Builder for test outbox events.
#[derive(Debug, Clone)]
pub struct OutboxEventBuilder {
    id: EventId,
    aggregate_id: AggregateId,
    aggregate_type: String,
    event_type: String,
    payload: Map<String, Value>,
    status: EventStatus,
    retry_count: i32,
    published_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl OutboxEventBuilder {
    /// Pending `invoice.purchase.created` event with a random amount.
    pub fn new() -> Self {
        let amount: u32 = rand::rng().random_range(1..10_000);
        let payload = json!({"user_id": "u1", "amount": amount});

        Self {
            id: EventId::new(),
            aggregate_id: AggregateId::new(),
            aggregate_type: "invoice".to_string(),
            event_type: "purchase.created".to_string(),
            payload: payload.as_object().cloned().unwrap_or_default(),
            status: EventStatus::Pending,
            retry_count: 0,
            published_at: None,
            failed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Sets the aggregate id.
    #[must_use]
    pub fn aggregate(mut self, id: AggregateId) -> Self {
        self.aggregate_id = id;
        self
    }

    /// Sets both type tags.
    #[must_use]
    pub fn kind(mut self, aggregate_type: &str, event_type: &str) -> Self {
        self.aggregate_type = aggregate_type.to_string();
        self.event_type = event_type.to_string();
        self
    }

    /// Replaces the payload. Non-object values produce an empty payload.
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload.as_object().cloned().unwrap_or_default();
        self
    }

    /// Sets the creation time.
    #[must_use]
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Backdates the creation time.
    #[must_use]
    pub fn created_ago(self, age: Duration) -> Self {
        let at = Utc::now() - age;
        self.created_at(at)
    }

    /// Sets the failed-attempt counter.
    #[must_use]
    pub fn retries(mut self, retry_count: i32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Makes the event published at `at`.
    #[must_use]
    pub fn published_at(mut self, at: DateTime<Utc>) -> Self {
        self.status = EventStatus::Published;
        self.published_at = Some(at);
        self.failed_at = None;
        self
    }

    /// Makes the event failed at `at` with its retry budget spent.
    #[must_use]
    pub fn failed_at(mut self, at: DateTime<Utc>) -> Self {
        self.status = EventStatus::Failed;
        self.retry_count = courier_core::MAX_RETRIES;
        self.failed_at = Some(at);
        self.published_at = None;
        self
    }

    /// Builds the event.
    pub fn build(self) -> OutboxEvent {
        OutboxEvent {
            id: self.id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            event_type: self.event_type,
            payload: sqlx::types::Json(self.payload),
            status: self.status,
            retry_count: self.retry_count,
            next_retry_at: None,
            published_at: self.published_at,
            failed_at: self.failed_at,
            created_at: self.created_at,
        }
    }
}

impl Default for OutboxEventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// `count` pending events created one second apart, oldest first.
pub fn pending_events(count: usize) -> Vec<OutboxEvent> {
    let base = Utc::now() - Duration::hours(1);
    (0..count)
        .map(|i| OutboxEventBuilder::new().created_at(base + Duration::seconds(i as i64)).build())
        .collect()
}
