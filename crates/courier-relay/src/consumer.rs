//! Idempotent consumption of outbox messages.
//!
//! The bus delivers at least once. [`IdempotentConsumer`] turns that into
//! effectively-once side effects by applying the handler and recording
//! `(event_id, consumer_name)` in the idempotency ledger inside one
//! transaction:
//!
//! ```text
//! begin ─▶ is_processed? ── yes ─▶ rollback, ack as duplicate
//!              │ no
//!              ▼
//!          handler.handle(tx) ── error ─▶ rollback, surface error
//!              ▼
//!          mark_as_processed ── lost race ─▶ rollback, ack as duplicate
//!              ▼
//!          commit
//! ```

use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;
use courier_core::{BoxFuture, EventId, IdempotencyLedger};
use serde::de::DeserializeOwned;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    error::{RelayError, Result},
    publisher::OutboundMessage,
    topic::topic_matches,
};

/// Error type returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Bus message id; carries the outbox event id.
    pub message_id: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Headers as published.
    pub headers: BTreeMap<String, String>,
    /// Raw body.
    pub body: Bytes,
}

impl InboundMessage {
    /// Creates an inbound message.
    pub fn new(
        message_id: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            routing_key: routing_key.into(),
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Receives an outbound message as-is, as a loopback bus would.
    pub fn from_outbound(message: OutboundMessage) -> Self {
        Self {
            message_id: message.message_id,
            routing_key: message.routing_key,
            headers: message.headers,
            body: message.body,
        }
    }

    /// Event id taken from the message id, never regenerated.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidMessage` if the id is not a UUID.
    pub fn event_id(&self) -> Result<EventId> {
        self.message_id.parse().map_err(|_| {
            RelayError::InvalidMessage(format!(
                "message id {:?} is not an event id",
                self.message_id
            ))
        })
    }

    /// Decodes the JSON body.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidMessage` if the body does not decode as `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| RelayError::InvalidMessage(format!("undecodable payload: {e}")))
    }
}

/// Business logic run for each accepted message.
///
/// `Tx` is the ledger's transaction; side effects written through it commit
/// or roll back together with the ledger row.
pub trait MessageHandler<Tx>: Send + Sync {
    /// Consumer name recorded in the ledger. Must be stable across releases.
    fn name(&self) -> &str;

    /// Topic patterns this handler subscribes to.
    fn topics(&self) -> &[String];

    /// Applies the message's effects within `tx`.
    fn handle<'a>(
        &'a self,
        tx: &'a mut Tx,
        message: &'a InboundMessage,
    ) -> BoxFuture<'a, std::result::Result<(), HandlerError>>;
}

impl<Tx, H: MessageHandler<Tx> + ?Sized> MessageHandler<Tx> for Arc<H> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn topics(&self) -> &[String] {
        (**self).topics()
    }

    fn handle<'a>(
        &'a self,
        tx: &'a mut Tx,
        message: &'a InboundMessage,
    ) -> BoxFuture<'a, std::result::Result<(), HandlerError>> {
        (**self).handle(tx, message)
    }
}

/// How a delivery was settled. Every variant means the message can be acked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Effects applied and recorded.
    Applied,
    /// Already processed by this consumer; nothing applied.
    Duplicate,
    /// Routing key matches none of the handler's topics.
    Ignored,
}

/// Wraps a handler with ledger bookkeeping.
pub struct IdempotentConsumer<L, H> {
    ledger: Arc<L>,
    handler: H,
}

impl<L, H> IdempotentConsumer<L, H>
where
    L: IdempotencyLedger,
    H: MessageHandler<L::Tx>,
{
    /// Creates a consumer.
    pub fn new(ledger: Arc<L>, handler: H) -> Self {
        Self { ledger, handler }
    }

    /// Consumer name.
    pub fn name(&self) -> &str {
        self.handler.name()
    }

    /// Returns true if any of the handler's topics matches `routing_key`.
    pub fn accepts(&self, routing_key: &str) -> bool {
        self.handler.topics().iter().any(|pattern| topic_matches(pattern, routing_key))
    }

    /// Processes one delivery.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidMessage` for a malformed message id,
    /// `RelayError::Handler` when the handler fails (nothing is recorded, so
    /// a redelivery runs it again), or a storage error.
    pub async fn consume(&self, message: &InboundMessage) -> Result<ConsumeOutcome> {
        if !self.accepts(&message.routing_key) {
            debug!(
                consumer = self.name(),
                routing_key = %message.routing_key,
                "topic not subscribed"
            );
            return Ok(ConsumeOutcome::Ignored);
        }

        let event_id = message.event_id()?;
        let span = info_span!(
            "consume",
            consumer = self.name(),
            %event_id,
            routing_key = %message.routing_key,
        );
        self.consume_event(event_id, message).instrument(span).await
    }

    async fn consume_event(
        &self,
        event_id: EventId,
        message: &InboundMessage,
    ) -> Result<ConsumeOutcome> {
        let consumer = self.handler.name();
        let mut tx = self.ledger.begin().await?;

        let seen = match self.ledger.is_processed(&mut tx, event_id, consumer).await {
            Ok(seen) => seen,
            Err(e) => {
                self.rollback(tx).await;
                return Err(e.into());
            },
        };
        if seen {
            self.rollback(tx).await;
            debug!("duplicate delivery acknowledged");
            return Ok(ConsumeOutcome::Duplicate);
        }

        if let Err(e) = self.handler.handle(&mut tx, message).await {
            self.rollback(tx).await;
            warn!(error = %e, "handler failed, effects rolled back");
            return Err(RelayError::Handler {
                consumer: consumer.to_string(),
                message: e.to_string(),
            });
        }

        let recorded = match self.ledger.mark_as_processed(&mut tx, event_id, consumer).await {
            Ok(recorded) => recorded,
            Err(e) => {
                self.rollback(tx).await;
                return Err(e.into());
            },
        };
        if !recorded {
            // A concurrent delivery recorded the event first; drop our effects.
            self.rollback(tx).await;
            debug!("lost race to concurrent delivery");
            return Ok(ConsumeOutcome::Duplicate);
        }

        self.ledger.commit(tx).await?;
        info!("event applied");
        Ok(ConsumeOutcome::Applied)
    }

    async fn rollback(&self, tx: L::Tx) {
        if let Err(e) = self.ledger.rollback(tx).await {
            warn!(error = %e, "rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_comes_from_message_id() {
        let id = EventId::new();
        let message = InboundMessage::new(id.to_string(), "invoice.created", "{}");
        assert_eq!(message.event_id().unwrap(), id);

        let bad = InboundMessage::new("not-a-uuid", "invoice.created", "{}");
        assert!(matches!(bad.event_id(), Err(RelayError::InvalidMessage(_))));
    }

    #[test]
    fn payload_decodes_json_body() {
        let message = InboundMessage::new(EventId::new().to_string(), "a.b", r#"{"user_id":"u1"}"#);
        let payload: serde_json::Value = message.payload().unwrap();
        assert_eq!(payload["user_id"], "u1");

        let garbage = InboundMessage::new(EventId::new().to_string(), "a.b", "nope");
        assert!(garbage.payload::<serde_json::Value>().is_err());
    }
}
