//! Message bus port and the outbound message built from an outbox event.

use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;
use courier_core::{BoxFuture, EventId, OutboxEvent};

use crate::error::PublishError;

/// Header carrying the aggregate id.
pub const HEADER_AGGREGATE_ID: &str = "aggregate_id";
/// Header carrying the aggregate type.
pub const HEADER_AGGREGATE_TYPE: &str = "aggregate_type";
/// Header carrying the event type.
pub const HEADER_EVENT_TYPE: &str = "event_type";

/// A message ready to be handed to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Deduplication id; always the outbox event id.
    pub message_id: String,
    /// `{aggregate_type}.{event_type}`.
    pub routing_key: String,
    /// Provenance headers.
    pub headers: BTreeMap<String, String>,
    /// JSON-encoded payload.
    pub body: Bytes,
    /// MIME type of `body`.
    pub content_type: String,
    /// Ask the broker to persist the message to disk.
    pub persistent: bool,
}

impl OutboundMessage {
    /// Builds the outbound message for an outbox event.
    ///
    /// # Errors
    ///
    /// Returns `PublishError::Serialization` if the payload cannot be encoded.
    pub fn from_event(event: &OutboxEvent) -> Result<Self, PublishError> {
        let body = serde_json::to_vec(&event.payload.0)
            .map_err(|e| PublishError::Serialization(e.to_string()))?;

        let headers = BTreeMap::from([
            (HEADER_AGGREGATE_ID.to_string(), event.aggregate_id.to_string()),
            (HEADER_AGGREGATE_TYPE.to_string(), event.aggregate_type.clone()),
            (HEADER_EVENT_TYPE.to_string(), event.event_type.clone()),
        ]);

        Ok(Self {
            message_id: event.id.to_string(),
            routing_key: event.routing_key(),
            headers,
            body: Bytes::from(body),
            content_type: "application/json".to_string(),
            persistent: true,
        })
    }

    /// Parses `message_id` back into the event id.
    pub fn event_id(&self) -> Option<EventId> {
        self.message_id.parse().ok()
    }
}

/// Publishes messages to the bus.
///
/// A successful return means the broker accepted responsibility for the
/// message; anything else is a publish failure the dispatcher may retry.
pub trait MessagePublisher: Send + Sync {
    /// Publishes one message.
    fn publish(&self, message: OutboundMessage) -> BoxFuture<'_, Result<(), PublishError>>;
}

impl<P: MessagePublisher + ?Sized> MessagePublisher for Arc<P> {
    fn publish(&self, message: OutboundMessage) -> BoxFuture<'_, Result<(), PublishError>> {
        (**self).publish(message)
    }
}
