//! In-process message bus double with failure injection.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use courier_core::{BoxFuture, EventId};
use courier_relay::{MessagePublisher, OutboundMessage, PublishError};

/// Scripted failure for upcoming publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Broker unreachable.
    Network,
    /// Broker answered 5xx.
    BrokerError,
    /// Message routed nowhere.
    Unroutable,
    /// Publish hangs for the given time before succeeding.
    Delay(Duration),
}

impl FailureKind {
    fn into_error(self, message: &OutboundMessage) -> Option<PublishError> {
        match self {
            Self::Network => Some(PublishError::network("connection refused")),
            Self::BrokerError => Some(PublishError::from_status(503, "service unavailable")),
            Self::Unroutable => {
                Some(PublishError::Unroutable { routing_key: message.routing_key.clone() })
            },
            Self::Delay(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    published: Vec<OutboundMessage>,
    attempts: u64,
    always_fail: Option<FailureKind>,
    per_event: HashMap<EventId, (FailureKind, usize)>,
}

/// Records every accepted message and fails on request.
///
/// Per-event scripts take precedence over the always-fail mode.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    state: Mutex<State>,
}

impl RecordingPublisher {
    /// Creates a publisher that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every publish with `kind` until [`RecordingPublisher::recover`].
    pub fn fail_always(&self, kind: FailureKind) {
        self.lock().always_fail = Some(kind);
    }

    /// Fails the next `count` publishes of one event.
    pub fn fail_event(&self, event_id: EventId, count: usize, kind: FailureKind) {
        self.lock().per_event.insert(event_id, (kind, count));
    }

    /// Clears every scripted failure.
    pub fn recover(&self) {
        let mut state = self.lock();
        state.always_fail = None;
        state.per_event.clear();
    }

    /// Messages accepted so far, in publish order.
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.lock().published.clone()
    }

    /// Number of accepted messages.
    pub fn published_count(&self) -> usize {
        self.lock().published.len()
    }

    /// Accepted messages carrying `event_id`.
    pub fn published_for(&self, event_id: EventId) -> Vec<OutboundMessage> {
        let id = event_id.to_string();
        self.lock().published.iter().filter(|m| m.message_id == id).cloned().collect()
    }

    /// Publish calls made, successful or not.
    pub fn attempts(&self) -> u64 {
        self.lock().attempts
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_failure(&self, message: &OutboundMessage) -> Option<FailureKind> {
        let mut state = self.lock();
        state.attempts += 1;

        if let Some(event_id) = message.event_id() {
            if let Some((kind, remaining)) = state.per_event.get_mut(&event_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Some(kind.clone());
                }
            }
        }
        state.always_fail.clone()
    }

    fn record(&self, message: OutboundMessage) {
        self.lock().published.push(message);
    }
}

impl MessagePublisher for RecordingPublisher {
    fn publish(&self, message: OutboundMessage) -> BoxFuture<'_, Result<(), PublishError>> {
        Box::pin(async move {
            match self.next_failure(&message) {
                Some(FailureKind::Delay(delay)) => tokio::time::sleep(delay).await,
                Some(kind) => {
                    if let Some(error) = kind.into_error(&message) {
                        return Err(error);
                    }
                },
                None => {},
            }
            self.record(message);
            Ok(())
        })
    }
}
