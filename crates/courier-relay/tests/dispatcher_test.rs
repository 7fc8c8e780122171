//! Dispatcher behavior against the in-memory store and recording publisher.

use std::time::Duration;

use courier_core::{Clock, CoreError, EventStatus, EventStore, Transactional, MAX_RETRIES};
use courier_relay::{DispatchStats, DispatcherConfig, RelayError};
use courier_testing::{pending_events, FailureKind, OutboxEventBuilder, TestEnv};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn empty_outbox_is_a_noop() -> anyhow::Result<()> {
    let env = TestEnv::new();

    let published = env.dispatcher().dispatch().await?;

    assert_eq!(published, 0);
    assert_eq!(env.publisher.attempts(), 0);
    Ok(())
}

#[tokio::test]
async fn pending_events_are_published_oldest_first() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let mut events = pending_events(3);
    events.reverse();
    env.save_all(&events).await?;

    let published = env.dispatcher().dispatch().await?;
    assert_eq!(published, 3);

    let order: Vec<String> = env.publisher.published().into_iter().map(|m| m.message_id).collect();
    let expected: Vec<String> = events.iter().rev().map(|e| e.id.to_string()).collect();
    assert_eq!(order, expected);

    for event in &events {
        let stored = env.event(event.id).await?;
        assert_eq!(stored.status, EventStatus::Published);
        assert_eq!(stored.published_at, Some(env.clock.now_utc()));
        assert_eq!(stored.retry_count, 0);
    }
    assert_eq!(env.store.locked_count(), 0);
    env.assert_invariants()
}

#[tokio::test]
async fn published_message_carries_routing_key_and_headers() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let event = OutboxEventBuilder::new()
        .kind("invoice", "purchase.created")
        .payload(serde_json::json!({"user_id": "u1"}))
        .build();
    env.save(&event).await?;

    env.dispatcher().dispatch().await?;

    let messages = env.publisher.published_for(event.id);
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.routing_key, "invoice.purchase.created");
    assert_eq!(message.headers["aggregate_id"], event.aggregate_id.to_string());
    assert_eq!(message.headers["aggregate_type"], "invoice");
    assert_eq!(message.headers["event_type"], "purchase.created");
    assert!(message.persistent);
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&message.body)?,
        serde_json::json!({"user_id": "u1"})
    );
    Ok(())
}

#[tokio::test]
async fn publish_failure_keeps_event_pending_with_backoff() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let event = OutboxEventBuilder::new().build();
    env.save(&event).await?;
    env.publisher.fail_event(event.id, 1, FailureKind::Network);

    let published = env.dispatcher().dispatch().await?;
    assert_eq!(published, 0);

    let stored = env.event(event.id).await?;
    assert_eq!(stored.status, EventStatus::Pending);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.next_retry_at, Some(env.clock.now_utc() + chrono::Duration::seconds(30)));

    // next_retry_at is advisory; the very next run picks the event up again.
    let published = env.dispatcher().dispatch().await?;
    assert_eq!(published, 1);
    assert_eq!(env.event(event.id).await?.status, EventStatus::Published);
    env.assert_invariants()
}

#[tokio::test]
async fn three_failures_mark_event_failed() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let event = OutboxEventBuilder::new().build();
    env.save(&event).await?;
    env.publisher.fail_event(event.id, 3, FailureKind::BrokerError);
    let dispatcher = env.dispatcher();

    for attempt in 1..MAX_RETRIES {
        dispatcher.dispatch().await?;
        let stored = env.event(event.id).await?;
        assert_eq!(stored.status, EventStatus::Pending, "attempt {attempt}");
        assert_eq!(stored.retry_count, attempt);
    }

    dispatcher.dispatch().await?;
    let mut stored = env.event(event.id).await?;
    assert_eq!(stored.status, EventStatus::Failed);
    assert_eq!(stored.retry_count, MAX_RETRIES);
    assert_eq!(stored.failed_at, Some(env.clock.now_utc()));
    assert!(stored.published_at.is_none());

    let err = stored
        .increment_retry(env.clock.now_utc(), &dispatcher.config().backoff)
        .unwrap_err();
    assert!(matches!(err, CoreError::RetriesExhausted { retry_count: 3, .. }));

    // Failed rows are never picked up again.
    assert_eq!(dispatcher.dispatch().await?, 0);
    assert_eq!(env.publisher.attempts(), 3);

    let stats = dispatcher.stats().await;
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.failed, 1);
    env.assert_invariants()
}

#[tokio::test]
async fn one_failing_event_does_not_abort_the_batch() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let events = pending_events(3);
    env.save_all(&events).await?;
    env.publisher.fail_event(events[1].id, 1, FailureKind::Unroutable);

    let published = env.dispatcher().dispatch().await?;

    assert_eq!(published, 2);
    assert_eq!(env.event(events[0].id).await?.status, EventStatus::Published);
    assert_eq!(env.event(events[1].id).await?.retry_count, 1);
    assert_eq!(env.event(events[2].id).await?.status, EventStatus::Published);
    Ok(())
}

#[tokio::test]
async fn persistence_failure_after_publish_leads_to_republish() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let event = OutboxEventBuilder::new().build();
    env.save(&event).await?;
    env.store.fail_updates_for(event.id);
    let dispatcher = env.dispatcher();

    let published = dispatcher.dispatch().await?;
    assert_eq!(published, 0);
    assert_eq!(env.publisher.published_for(event.id).len(), 1);

    let stored = env.event(event.id).await?;
    assert_eq!(stored.status, EventStatus::Pending);
    assert!(stored.published_at.is_none());
    assert_eq!(dispatcher.stats().await.persistence_failures, 1);

    env.store.clear_update_failures();
    assert_eq!(dispatcher.dispatch().await?, 1);
    assert_eq!(env.publisher.published_for(event.id).len(), 2);
    assert_eq!(env.event(event.id).await?.status, EventStatus::Published);
    Ok(())
}

#[tokio::test]
async fn batch_fetch_failure_propagates() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.save(&OutboxEventBuilder::new().build()).await?;
    env.store.fail_next_batch("connection reset");

    let err = env.dispatcher().dispatch().await.unwrap_err();

    assert!(matches!(err, RelayError::Storage(CoreError::Database(_))));
    assert_eq!(env.publisher.attempts(), 0);
    assert_eq!(env.store.locked_count(), 0);

    assert_eq!(env.dispatcher().dispatch().await?, 1);
    Ok(())
}

#[tokio::test]
async fn transaction_begin_failure_propagates() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.store.fail_next_begin("too many connections");

    let err = env.dispatcher().dispatch().await.unwrap_err();
    assert!(matches!(err, RelayError::Storage(CoreError::Database(_))));
    Ok(())
}

#[tokio::test]
async fn batch_size_limits_each_run() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.save_all(&pending_events(5)).await?;
    let dispatcher =
        env.dispatcher_with(DispatcherConfig { batch_size: 2, ..DispatcherConfig::default() });

    assert_eq!(dispatcher.dispatch().await?, 2);
    assert_eq!(env.store.count_by_status(EventStatus::Pending).await?, 3);

    assert_eq!(dispatcher.dispatch().await?, 2);
    assert_eq!(dispatcher.dispatch().await?, 1);
    assert_eq!(dispatcher.dispatch().await?, 0);
    assert_eq!(env.store.count_by_status(EventStatus::Published).await?, 5);
    Ok(())
}

#[tokio::test]
async fn locked_rows_are_skipped_by_a_concurrent_dispatch() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let events = pending_events(2);
    env.save_all(&events).await?;

    // Another dispatcher instance holds the first event's row lock.
    let mut other = env.store.begin().await?;
    let held = env.store.find_pending_batch(&mut other, 1).await?;
    assert_eq!(held[0].id, events[0].id);

    assert_eq!(env.dispatcher().dispatch().await?, 1);
    assert!(env.publisher.published_for(events[0].id).is_empty());
    assert_eq!(env.event(events[1].id).await?.status, EventStatus::Published);

    env.store.rollback(other).await?;
    assert_eq!(env.dispatcher().dispatch().await?, 1);
    assert_eq!(env.event(events[0].id).await?.status, EventStatus::Published);
    Ok(())
}

#[tokio::test]
async fn slow_publish_times_out_and_counts_as_failure() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let event = OutboxEventBuilder::new().build();
    env.save(&event).await?;
    env.publisher.fail_event(event.id, 1, FailureKind::Delay(Duration::from_secs(5)));
    let dispatcher = env.dispatcher_with(DispatcherConfig {
        publish_timeout: Duration::from_millis(20),
        ..DispatcherConfig::default()
    });

    assert_eq!(dispatcher.dispatch().await?, 0);

    let stored = env.event(event.id).await?;
    assert_eq!(stored.status, EventStatus::Pending);
    assert_eq!(stored.retry_count, 1);
    assert!(env.publisher.published().is_empty());
    Ok(())
}

#[tokio::test]
async fn cancelled_dispatch_releases_untouched_rows() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.save_all(&pending_events(3)).await?;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let published = env.dispatcher().dispatch_until_cancelled(&cancel).await?;

    assert_eq!(published, 0);
    assert_eq!(env.publisher.attempts(), 0);
    assert_eq!(env.store.count_by_status(EventStatus::Pending).await?, 3);
    assert_eq!(env.store.locked_count(), 0);
    Ok(())
}

#[tokio::test]
async fn deadline_commits_handled_events_and_leaves_rest_pending() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let events = pending_events(4);
    env.save_all(&events).await?;
    env.publisher.fail_always(FailureKind::Delay(Duration::from_millis(100)));

    let published = env
        .dispatcher()
        .dispatch_within(&CancellationToken::new(), Duration::from_millis(250))
        .await?;

    assert_eq!(published, 2);
    assert_eq!(env.publisher.published_count(), 2);
    for event in &events[..2] {
        assert_eq!(env.event(event.id).await?.status, EventStatus::Published);
    }
    for event in &events[2..] {
        let stored = env.event(event.id).await?;
        assert_eq!(stored.status, EventStatus::Pending);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.next_retry_at, None);
    }
    assert_eq!(env.store.locked_count(), 0);

    let budget = Duration::from_secs(5);
    let published = env.dispatcher().dispatch_within(&CancellationToken::new(), budget).await?;
    assert_eq!(published, 2);
    for event in &events {
        assert_eq!(env.publisher.published_for(event.id).len(), 1);
    }
    env.assert_invariants()
}

#[tokio::test]
async fn stats_accumulate_across_runs() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let events = pending_events(2);
    env.save_all(&events).await?;
    env.publisher.fail_event(events[0].id, 1, FailureKind::Network);
    let dispatcher = env.dispatcher();

    dispatcher.dispatch().await?;
    dispatcher.dispatch().await?;
    dispatcher.dispatch().await?;

    assert_eq!(
        dispatcher.stats().await,
        DispatchStats { runs: 2, published: 2, retried: 1, failed: 0, persistence_failures: 0 }
    );
    Ok(())
}
