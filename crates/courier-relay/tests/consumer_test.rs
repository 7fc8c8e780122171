//! Idempotent consumer behavior: duplicates, races and handler failures.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use courier_core::{BoxFuture, EventId, IdempotencyLedger, InMemoryStore, MemoryTx, Transactional};
use courier_relay::{
    ConsumeOutcome, HandlerError, IdempotentConsumer, InboundMessage, MessageHandler,
    OutboundMessage, RelayError,
};
use courier_testing::OutboxEventBuilder;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

const ENTRIES: &str = "budget_entries";

#[derive(Deserialize)]
struct Purchase {
    user_id: String,
}

struct BudgetProjector {
    topics: Vec<String>,
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl BudgetProjector {
    fn new() -> Self {
        Self {
            topics: vec!["invoice.#".to_string()],
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }
}

impl MessageHandler<MemoryTx> for BudgetProjector {
    fn name(&self) -> &str {
        "budget-projector"
    }

    fn topics(&self) -> &[String] {
        &self.topics
    }

    fn handle<'a>(
        &'a self,
        tx: &'a mut MemoryTx,
        message: &'a InboundMessage,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let purchase: Purchase = message.payload()?;
            tokio::task::yield_now().await;

            if self.fail.load(Ordering::SeqCst) {
                return Err("budget service unavailable".into());
            }
            // Unique key per call so every applied effect shows up as a row.
            tx.insert_row(ENTRIES, Uuid::new_v4().to_string(), json!({"user": purchase.user_id}));
            Ok(())
        })
    }
}

fn purchase_message() -> (EventId, InboundMessage) {
    let event = OutboxEventBuilder::new()
        .kind("invoice", "purchase.created")
        .payload(json!({"user_id": "u1"}))
        .build();
    let message = OutboundMessage::from_event(&event).unwrap();
    (event.id, InboundMessage::from_outbound(message))
}

fn consumer(
    store: &Arc<InMemoryStore>,
) -> (Arc<BudgetProjector>, IdempotentConsumer<InMemoryStore, Arc<BudgetProjector>>) {
    let handler = Arc::new(BudgetProjector::new());
    (handler.clone(), IdempotentConsumer::new(store.clone(), handler))
}

#[tokio::test]
async fn first_delivery_applies_and_records() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let (_, consumer) = consumer(&store);
    let (event_id, message) = purchase_message();

    assert_eq!(consumer.consume(&message).await?, ConsumeOutcome::Applied);

    assert_eq!(store.row_count(ENTRIES), 1);
    assert_eq!(store.processed_count(event_id), 1);

    let mut tx = store.begin().await?;
    assert!(store.is_processed(&mut tx, event_id, "budget-projector").await?);
    assert!(!store.is_processed(&mut tx, event_id, "email-sender").await?);
    Ok(())
}

#[tokio::test]
async fn redelivery_is_acknowledged_without_reapplying() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let (handler, consumer) = consumer(&store);
    let (event_id, message) = purchase_message();

    consumer.consume(&message).await?;
    assert_eq!(consumer.consume(&message).await?, ConsumeOutcome::Duplicate);
    assert_eq!(consumer.consume(&message).await?, ConsumeOutcome::Duplicate);

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.row_count(ENTRIES), 1);
    assert_eq!(store.processed_count(event_id), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_apply_effects_once() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let (_, consumer) = consumer(&store);
    let consumer = Arc::new(consumer);
    let (event_id, message) = purchase_message();

    let mut deliveries = Vec::new();
    for _ in 0..8 {
        let consumer = consumer.clone();
        let message = message.clone();
        deliveries.push(tokio::spawn(async move { consumer.consume(&message).await }));
    }

    let mut applied = 0;
    for delivery in deliveries {
        match delivery.await?? {
            ConsumeOutcome::Applied => applied += 1,
            ConsumeOutcome::Duplicate => {},
            ConsumeOutcome::Ignored => panic!("subscribed topic ignored"),
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(store.row_count(ENTRIES), 1);
    assert_eq!(store.processed_count(event_id), 1);
    Ok(())
}

#[tokio::test]
async fn handler_failure_records_nothing_and_allows_redelivery() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let (handler, consumer) = consumer(&store);
    let (event_id, message) = purchase_message();
    handler.fail.store(true, Ordering::SeqCst);

    let err = consumer.consume(&message).await.unwrap_err();
    assert!(matches!(
        err,
        RelayError::Handler { ref consumer, .. } if consumer == "budget-projector"
    ));
    assert_eq!(store.row_count(ENTRIES), 0);
    assert_eq!(store.processed_count(event_id), 0);

    handler.fail.store(false, Ordering::SeqCst);
    assert_eq!(consumer.consume(&message).await?, ConsumeOutcome::Applied);
    assert_eq!(store.row_count(ENTRIES), 1);
    Ok(())
}

#[tokio::test]
async fn unsubscribed_topics_are_ignored() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let (handler, consumer) = consumer(&store);
    let message = InboundMessage::new(EventId::new().to_string(), "shipment.dispatched", "{}");

    assert!(consumer.accepts("invoice.purchase.created"));
    assert!(!consumer.accepts("shipment.dispatched"));
    assert_eq!(consumer.consume(&message).await?, ConsumeOutcome::Ignored);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn message_without_event_id_is_rejected() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let (handler, consumer) = consumer(&store);
    let message = InboundMessage::new("regenerated-id", "invoice.purchase.created", "{}");

    let err = consumer.consume(&message).await.unwrap_err();
    assert!(matches!(err, RelayError::InvalidMessage(_)));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn consumers_track_the_same_event_independently() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let (_, consumer) = consumer(&store);
    let (event_id, message) = purchase_message();

    let mut tx = store.begin().await?;
    assert!(store.mark_as_processed(&mut tx, event_id, "email-sender").await?);
    store.commit(tx).await?;

    assert_eq!(consumer.consume(&message).await?, ConsumeOutcome::Applied);
    assert_eq!(store.processed_count(event_id), 2);
    Ok(())
}
