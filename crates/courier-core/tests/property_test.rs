//! Property-based tests for outbox state machine and store invariants.
//!
//! Runs entirely in memory; no database required.

#![allow(clippy::unwrap_used)]

use std::collections::HashSet;

use chrono::{Duration, TimeZone, Utc};
use courier_core::{
    AggregateId, BackoffTable, EventStatus, EventStore, InMemoryStore, OutboxEvent, Transactional,
    MAX_RETRIES,
};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use serde_json::{Map, Value};

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 64,
        fork: false,
        failure_persistence: None,
        source_file: None,
        ..ProptestConfig::default()
    }
}

#[derive(Debug, Clone, Copy)]
enum Transition {
    IncrementRetry,
    Publish,
    Fail,
    Pending,
}

fn transition_strategy() -> impl Strategy<Value = Vec<Transition>> {
    prop::collection::vec(
        prop::sample::select(vec![
            Transition::IncrementRetry,
            Transition::Publish,
            Transition::Fail,
            Transition::Pending,
        ]),
        0..32,
    )
}

fn payload_strategy() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-z_]{1,12}", any::<i64>(), 1..6)
        .prop_map(|entries| entries.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
}

fn event(payload: Map<String, Value>) -> OutboxEvent {
    OutboxEvent::new(AggregateId::new(), "invoice", "purchase.created", payload).unwrap()
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn retry_count_never_exceeds_limit(
        transitions in transition_strategy(),
        payload in payload_strategy(),
    ) {
        let backoff = BackoffTable::default();
        let mut event = event(payload);
        let mut now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        for transition in transitions {
            now += Duration::seconds(1);
            let before = event.retry_count;
            match transition {
                Transition::IncrementRetry => {
                    let result = event.increment_retry(now, &backoff);
                    if before >= MAX_RETRIES {
                        prop_assert!(result.is_err());
                        prop_assert_eq!(event.retry_count, before);
                    }
                },
                Transition::Publish => {
                    let _ = event.mark_as_published(now);
                },
                Transition::Fail => {
                    let _ = event.mark_as_failed(now);
                },
                Transition::Pending => event.mark_as_pending(),
            }

            prop_assert!(event.retry_count <= MAX_RETRIES);
            prop_assert!(event.retry_count >= 0);
        }
    }

    #[test]
    fn terminal_timestamps_are_exclusive(
        transitions in transition_strategy(),
        payload in payload_strategy(),
    ) {
        let backoff = BackoffTable::default();
        let mut event = event(payload);
        let created_at = event.created_at;
        let now = Utc::now();

        for transition in transitions {
            match transition {
                Transition::IncrementRetry => {
                    let _ = event.increment_retry(now, &backoff);
                },
                Transition::Publish => {
                    let _ = event.mark_as_published(now);
                },
                Transition::Fail => {
                    let _ = event.mark_as_failed(now);
                },
                Transition::Pending => event.mark_as_pending(),
            }

            prop_assert!(event.published_at.is_none() || event.failed_at.is_none());
            prop_assert_eq!(event.created_at, created_at);
            prop_assert_eq!(event.status == EventStatus::Published, event.published_at.is_some());
            prop_assert_eq!(event.status == EventStatus::Failed, event.failed_at.is_some());
        }
    }

    #[test]
    fn concurrent_batches_are_disjoint(
        pending in 0usize..40,
        first_limit in 1usize..30,
        second_limit in 1usize..30,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let store = InMemoryStore::new();
            for i in 0..pending {
                let mut map = Map::new();
                map.insert("n".to_string(), Value::from(i));
                store.insert_committed(event(map));
            }

            let mut first = store.begin().await.unwrap();
            let mut second = store.begin().await.unwrap();
            let a = store.find_pending_batch(&mut first, first_limit).await.unwrap();
            let b = store.find_pending_batch(&mut second, second_limit).await.unwrap();

            let a_ids: HashSet<_> = a.iter().map(|e| e.id).collect();
            let b_ids: HashSet<_> = b.iter().map(|e| e.id).collect();
            prop_assert!(a_ids.is_disjoint(&b_ids));
            prop_assert_eq!(a.len(), first_limit.min(pending));
            prop_assert_eq!(b.len(), second_limit.min(pending - a.len()));

            store.rollback(first).await.unwrap();
            store.rollback(second).await.unwrap();
            prop_assert_eq!(store.locked_count(), 0);
            Ok(())
        })?;
    }
}
