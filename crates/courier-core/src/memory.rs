//! In-memory implementation of the persistence ports.
//!
//! Mirrors the PostgreSQL semantics the relay depends on: writes made through
//! a [`MemoryTx`] become visible only on commit, rows returned by
//! `find_pending_batch` stay locked until their transaction ends and are
//! skipped by every other transaction, and ledger inserts race on a unique
//! `(event_id, consumer_name)` key. Dropping an unfinished transaction rolls
//! it back.
//!
//! Failure injection hooks let tests force begin, batch and update errors.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
    error::{CoreError, Result},
    models::{EventId, EventStatus, OutboxEvent},
    store::{BoxFuture, EventStore, IdempotencyLedger, Transactional},
};

type LedgerKey = (EventId, String);

#[derive(Debug, Default)]
struct State {
    /// Committed events in insertion order.
    events: Vec<OutboxEvent>,
    /// Row locks: event id to owning transaction.
    locks: HashMap<EventId, u64>,
    processed: HashMap<LedgerKey, DateTime<Utc>>,
    /// Uncommitted ledger inserts: key to owning transaction.
    claims: HashMap<LedgerKey, u64>,
    /// Business rows written alongside events, by table then key.
    rows: HashMap<String, HashMap<String, Value>>,
    next_tx: u64,
    fail_next_begin: Option<String>,
    fail_next_batch: Option<String>,
    failing_updates: HashSet<EventId>,
}

impl State {
    fn release(&mut self, tx_id: u64) {
        self.locks.retain(|_, owner| *owner != tx_id);
        self.claims.retain(|_, owner| *owner != tx_id);
    }

    fn position(&self, id: EventId) -> Option<usize> {
        self.events.iter().position(|e| e.id == id)
    }
}

/// Thread-safe in-memory outbox and idempotency ledger.
///
/// Clones share state, so a store handed to a dispatcher can be inspected
/// from the test body.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

/// Transaction handle for [`InMemoryStore`].
#[derive(Debug)]
pub struct MemoryTx {
    id: u64,
    state: Arc<Mutex<State>>,
    inserted: Vec<OutboxEvent>,
    updated: Vec<OutboxEvent>,
    marks: Vec<(LedgerKey, DateTime<Utc>)>,
    rows: Vec<(String, String, Value)>,
    finished: bool,
}

impl MemoryTx {
    /// Stages a business row to be written on commit.
    ///
    /// Stands in for the domain writes an event is appended alongside.
    pub fn insert_row(&mut self, table: impl Into<String>, key: impl Into<String>, value: Value) {
        self.rows.push((table.into(), key.into(), value));
    }

    /// Transaction identifier, unique per store.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current view of an event: own staged writes first, then committed.
    fn visible(&self, state: &State, id: EventId) -> Option<OutboxEvent> {
        self.updated
            .iter()
            .rev()
            .chain(self.inserted.iter())
            .find(|e| e.id == id)
            .cloned()
            .or_else(|| state.position(id).map(|i| state.events[i].clone()))
    }

    fn apply(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.events.append(&mut self.inserted);
        for event in self.updated.drain(..) {
            if let Some(i) = state.position(event.id) {
                state.events[i] = event;
            }
        }
        for (key, at) in self.marks.drain(..) {
            state.processed.entry(key).or_insert(at);
        }
        for (table, key, value) in self.rows.drain(..) {
            state.rows.entry(table).or_default().insert(key, value);
        }
        state.release(self.id);
        self.finished = true;
    }

    fn discard(&mut self) {
        if !self.finished {
            self.lock_state().release(self.id);
            self.finished = true;
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.discard();
    }
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts an already committed event, bypassing transactions.
    ///
    /// Lets tests seed rows in any status, e.g. old published events for the
    /// cleaner.
    pub fn insert_committed(&self, event: OutboxEvent) {
        self.lock_state().events.push(event);
    }

    /// Snapshot of all committed events in insertion order.
    pub fn events(&self) -> Vec<OutboxEvent> {
        self.lock_state().events.clone()
    }

    /// Committed business row, if any.
    pub fn row(&self, table: &str, key: &str) -> Option<Value> {
        self.lock_state().rows.get(table).and_then(|rows| rows.get(key)).cloned()
    }

    /// Number of committed business rows in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.lock_state().rows.get(table).map_or(0, HashMap::len)
    }

    /// Number of ledger entries recorded for `event_id`.
    pub fn processed_count(&self, event_id: EventId) -> usize {
        self.lock_state().processed.keys().filter(|(id, _)| *id == event_id).count()
    }

    /// Number of event rows currently locked by open transactions.
    pub fn locked_count(&self) -> usize {
        self.lock_state().locks.len()
    }

    /// Makes the next `begin` fail with a database error.
    pub fn fail_next_begin(&self, message: impl Into<String>) {
        self.lock_state().fail_next_begin = Some(message.into());
    }

    /// Makes the next `find_pending_batch` fail with a database error.
    pub fn fail_next_batch(&self, message: impl Into<String>) {
        self.lock_state().fail_next_batch = Some(message.into());
    }

    /// Makes every `update_status` for `event_id` fail until cleared.
    pub fn fail_updates_for(&self, event_id: EventId) {
        self.lock_state().failing_updates.insert(event_id);
    }

    /// Removes all update failure injections.
    pub fn clear_update_failures(&self) {
        self.lock_state().failing_updates.clear();
    }

    fn count_where(&self, predicate: impl Fn(&OutboxEvent) -> bool) -> u64 {
        self.lock_state().events.iter().filter(|e| predicate(e)).count() as u64
    }

    fn delete_where(&self, predicate: impl Fn(&OutboxEvent) -> bool) -> u64 {
        let mut state = self.lock_state();
        let before = state.events.len();
        state.events.retain(|e| !predicate(e));
        (before - state.events.len()) as u64
    }
}

fn published_before(cutoff: DateTime<Utc>) -> impl Fn(&OutboxEvent) -> bool {
    move |e| e.status == EventStatus::Published && e.published_at.is_some_and(|at| at < cutoff)
}

fn failed_before(cutoff: DateTime<Utc>) -> impl Fn(&OutboxEvent) -> bool {
    move |e| e.status == EventStatus::Failed && e.failed_at.is_some_and(|at| at < cutoff)
}

impl Transactional for InMemoryStore {
    type Tx = MemoryTx;

    fn begin(&self) -> BoxFuture<'_, Result<Self::Tx>> {
        Box::pin(async move {
            let mut state = self.lock_state();
            if let Some(message) = state.fail_next_begin.take() {
                return Err(CoreError::Database(message));
            }
            state.next_tx += 1;
            Ok(MemoryTx {
                id: state.next_tx,
                state: self.state.clone(),
                inserted: Vec::new(),
                updated: Vec::new(),
                marks: Vec::new(),
                rows: Vec::new(),
                finished: false,
            })
        })
    }

    fn commit(&self, mut tx: Self::Tx) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tx.apply();
            Ok(())
        })
    }

    fn rollback(&self, mut tx: Self::Tx) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tx.discard();
            Ok(())
        })
    }
}

impl EventStore for InMemoryStore {
    fn save<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        event: &'a OutboxEvent,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            event.validate()?;
            let duplicate = tx.inserted.iter().any(|e| e.id == event.id)
                || tx.lock_state().position(event.id).is_some();
            if duplicate {
                return Err(CoreError::ConstraintViolation(format!(
                    "outbox event {} already exists",
                    event.id
                )));
            }
            tx.inserted.push(event.clone());
            Ok(())
        })
    }

    fn find_pending_batch<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<OutboxEvent>>> {
        Box::pin(async move {
            let mut state = self.lock_state();
            if let Some(message) = state.fail_next_batch.take() {
                return Err(CoreError::Database(message));
            }

            let mut candidates: Vec<(usize, OutboxEvent)> = state
                .events
                .iter()
                .enumerate()
                .filter(|(_, e)| state.locks.get(&e.id).map_or(true, |owner| *owner == tx.id))
                .filter_map(|(seq, e)| tx.visible(&state, e.id).map(|view| (seq, view)))
                .filter(|(_, e)| e.status == EventStatus::Pending)
                .collect();
            candidates.sort_by_key(|(seq, e)| (e.created_at, *seq));
            candidates.truncate(limit);

            for (_, event) in &candidates {
                state.locks.insert(event.id, tx.id);
            }
            Ok(candidates.into_iter().map(|(_, e)| e).collect())
        })
    }

    fn update_status<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        event: &'a OutboxEvent,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            {
                let state = self.lock_state();
                if state.failing_updates.contains(&event.id) {
                    return Err(CoreError::Database(format!(
                        "injected update failure for event {}",
                        event.id
                    )));
                }
                if tx.visible(&state, event.id).is_none() {
                    return Err(CoreError::event_not_found(event.id));
                }
            }
            event.validate()?;

            if let Some(staged) = tx.inserted.iter_mut().find(|e| e.id == event.id) {
                *staged = event.clone();
            } else {
                tx.updated.push(event.clone());
            }
            Ok(())
        })
    }

    fn delete_published_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(self.delete_where(published_before(cutoff))) })
    }

    fn delete_failed_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(self.delete_where(failed_before(cutoff))) })
    }

    fn count_published_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(self.count_where(published_before(cutoff))) })
    }

    fn count_failed_before(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(self.count_where(failed_before(cutoff))) })
    }

    fn find_by_id(&self, id: EventId) -> BoxFuture<'_, Result<Option<OutboxEvent>>> {
        Box::pin(async move {
            let state = self.lock_state();
            Ok(state.position(id).map(|i| state.events[i].clone()))
        })
    }

    fn count_by_status(&self, status: EventStatus) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(self.count_where(|e| e.status == status)) })
    }

    fn requeue_failed(&self, id: EventId) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let mut state = self.lock_state();
            let Some(i) = state.position(id) else {
                return Ok(false);
            };
            let event = &mut state.events[i];
            if event.status != EventStatus::Failed {
                return Ok(false);
            }
            event.mark_as_pending();
            event.retry_count = 0;
            event.next_retry_at = None;
            Ok(true)
        })
    }
}

impl IdempotencyLedger for InMemoryStore {
    fn is_processed<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        event_id: EventId,
        consumer_name: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let key = (event_id, consumer_name.to_string());
            let committed = self.lock_state().processed.contains_key(&key);
            Ok(committed || tx.marks.iter().any(|(k, _)| *k == key))
        })
    }

    fn mark_as_processed<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        event_id: EventId,
        consumer_name: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let key = (event_id, consumer_name.to_string());
            if tx.marks.iter().any(|(k, _)| *k == key) {
                return Ok(false);
            }

            let mut state = self.lock_state();
            if state.processed.contains_key(&key) {
                return Ok(false);
            }
            match state.claims.get(&key) {
                Some(owner) if *owner != tx.id => return Ok(false),
                _ => {},
            }
            state.claims.insert(key.clone(), tx.id);
            drop(state);

            tx.marks.push((key, Utc::now()));
            Ok(true)
        })
    }
}
