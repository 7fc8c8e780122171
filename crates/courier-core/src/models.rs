//! Outbox domain models and strongly-typed identifiers.
//!
//! Defines the outbox event record, its delivery status and the idempotency
//! ledger entry, together with newtype ID wrappers and the database codecs
//! they need. The event record owns its state machine: every status change
//! goes through a method here so the invariants below hold by construction.
//!
//! # Invariants
//!
//! - `retry_count` never exceeds [`MAX_RETRIES`].
//! - `published_at` and `failed_at` are never both set.
//! - `created_at` is assigned once and never changes.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::types::Json;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    retry::BackoffTable,
};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult = std::result::Result<sqlx::encode::IsNull, sqlx::error::BoxDynError>;
type BoxDynError = sqlx::error::BoxDynError;

/// Maximum number of failed publish attempts before an event is abandoned.
pub const MAX_RETRIES: i32 = 3;

/// Strongly-typed outbox event identifier.
///
/// Generated when the event is created and reused as the outbound message id,
/// which is what consumers deduplicate on.
///
/// # Example
///
/// ```
/// use courier_core::models::EventId;
/// let event_id = EventId::new();
/// println!("publishing event: {}", event_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for EventId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::InvalidInput(format!("invalid event id {s:?}: {e}")))
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Identifier of the aggregate (invoice, budget, user...) an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateId(pub Uuid);

impl AggregateId {
    /// Creates a new random aggregate ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AggregateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for AggregateId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for AggregateId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AggregateId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for AggregateId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Delivery status of an outbox event.
///
/// `Pending` is the only non-terminal state. Once an event is `Published` or
/// `Failed` the dispatcher never touches it again; only the cleaner removes
/// it after the retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting for the dispatcher (first attempt or retry).
    Pending,

    /// Accepted by the message bus. Terminal success state.
    Published,

    /// Retry budget exhausted. Terminal failure state that needs an operator.
    Failed,
}

impl EventStatus {
    /// Database and wire representation of the status.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }

    /// Returns true for statuses the dispatcher never leaves.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Published | Self::Failed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::InvalidInput(format!("invalid event status: {other}"))),
        }
    }
}

impl sqlx::Type<PgDb> for EventStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for EventStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// A domain event waiting in (or delivered from) the outbox table.
///
/// Created by business code inside its own transaction, mutated only by the
/// dispatcher, deleted only by the cleaner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEvent {
    /// Unique identifier, also used as the outbound message id.
    pub id: EventId,

    /// Aggregate the event belongs to.
    pub aggregate_id: AggregateId,

    /// Aggregate type tag, e.g. `invoice`.
    pub aggregate_type: String,

    /// Event type tag, e.g. `purchase.created`.
    pub event_type: String,

    /// Structured payload serialized as the message body. Never empty.
    pub payload: Json<Map<String, Value>>,

    /// Current delivery status.
    pub status: EventStatus,

    /// Number of failed publish attempts, `0..=MAX_RETRIES`.
    pub retry_count: i32,

    /// Earliest time the next attempt is expected. Advisory only.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// When the bus accepted the event.
    pub published_at: Option<DateTime<Utc>>,

    /// When the event was abandoned.
    pub failed_at: Option<DateTime<Utc>>,

    /// When the event was appended to the outbox.
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Creates a pending event stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the payload is empty or either
    /// type tag is blank.
    pub fn new(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Result<Self> {
        Self::new_at(aggregate_id, aggregate_type, event_type, payload, Utc::now())
    }

    /// Creates a pending event with an explicit creation time.
    ///
    /// # Errors
    ///
    /// Same as [`OutboxEvent::new`].
    pub fn new_at(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: Map<String, Value>,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let event = Self {
            id: EventId::new(),
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            payload: Json(payload),
            status: EventStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            published_at: None,
            failed_at: None,
            created_at,
        };
        event.validate()?;
        Ok(event)
    }

    /// Builds an event from any serializable payload.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the payload does not serialize to
    /// a non-empty JSON object.
    pub fn from_payload<T: Serialize>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self> {
        match serde_json::to_value(payload)? {
            Value::Object(map) => Self::new(aggregate_id, aggregate_type, event_type, map),
            other => Err(CoreError::InvalidInput(format!(
                "event payload must be a JSON object, got {other}"
            ))),
        }
    }

    /// Checks the record against the storage boundary rules.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if self.payload.is_empty() {
            return Err(CoreError::InvalidInput(format!("event {} has an empty payload", self.id)));
        }
        if self.aggregate_type.trim().is_empty() {
            return Err(CoreError::InvalidInput("aggregate type must not be blank".to_string()));
        }
        if self.event_type.trim().is_empty() {
            return Err(CoreError::InvalidInput("event type must not be blank".to_string()));
        }
        if !(0..=MAX_RETRIES).contains(&self.retry_count) {
            return Err(CoreError::InvalidInput(format!(
                "retry count {} outside 0..={MAX_RETRIES}",
                self.retry_count
            )));
        }
        if self.published_at.is_some() && self.failed_at.is_some() {
            return Err(CoreError::InvalidInput(format!(
                "event {} cannot be both published and failed",
                self.id
            )));
        }
        Ok(())
    }

    /// Routing key used on the bus: `{aggregate_type}.{event_type}`.
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.aggregate_type, self.event_type)
    }

    /// Returns true while another failed attempt would still be retried.
    pub fn can_retry(&self) -> bool {
        self.retry_count < MAX_RETRIES
    }

    /// Records a failed publish attempt.
    ///
    /// Increments `retry_count` and schedules `next_retry_at` from the backoff
    /// table; attempts beyond the table leave `next_retry_at` empty.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::RetriesExhausted` once `retry_count` has reached
    /// [`MAX_RETRIES`], and `CoreError::InvalidTransition` for terminal
    /// events.
    pub fn increment_retry(&mut self, now: DateTime<Utc>, backoff: &BackoffTable) -> Result<()> {
        if self.retry_count >= MAX_RETRIES {
            return Err(CoreError::RetriesExhausted {
                event_id: self.id,
                retry_count: self.retry_count,
            });
        }
        self.ensure_pending(EventStatus::Pending)?;

        self.retry_count += 1;
        self.next_retry_at = backoff
            .delay_for(self.retry_count)
            .and_then(|delay| chrono::Duration::from_std(delay).ok())
            .map(|delay| now + delay);
        Ok(())
    }

    /// Marks the event as accepted by the bus.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the event is pending.
    pub fn mark_as_published(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_pending(EventStatus::Published)?;
        self.status = EventStatus::Published;
        self.published_at = Some(now);
        self.failed_at = None;
        self.next_retry_at = None;
        Ok(())
    }

    /// Abandons the event after its retry budget is spent.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the event is pending.
    pub fn mark_as_failed(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_pending(EventStatus::Failed)?;
        self.status = EventStatus::Failed;
        self.failed_at = Some(now);
        self.published_at = None;
        self.next_retry_at = None;
        Ok(())
    }

    /// Puts the event back to pending and clears both terminal timestamps.
    ///
    /// Used when a retry is still available and to undo an in-memory
    /// `published` mark whose persistence failed, so the next batch
    /// publishes it again.
    pub fn mark_as_pending(&mut self) {
        self.status = EventStatus::Pending;
        self.published_at = None;
        self.failed_at = None;
    }

    fn ensure_pending(&self, to: EventStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(CoreError::InvalidTransition { event_id: self.id, from: self.status, to });
        }
        Ok(())
    }
}

/// Idempotency ledger entry: `consumer_name` applied `event_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessedEvent {
    /// Event whose effects were applied.
    pub event_id: EventId,

    /// Logical consumer that applied them.
    pub consumer_name: String,

    /// When the effects were recorded.
    pub processed_at: DateTime<Utc>,
}
