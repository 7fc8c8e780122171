//! Assertions for properties every outbox state must satisfy.

use std::collections::HashSet;

use anyhow::{ensure, Result};
use courier_core::{EventId, EventStatus, OutboxEvent, MAX_RETRIES};

/// Outbox invariants.
pub struct Invariants;

impl Invariants {
    /// Retry counter stays within `0..=MAX_RETRIES`.
    pub fn retry_count_bounded(event: &OutboxEvent) -> Result<()> {
        ensure!(
            (0..=MAX_RETRIES).contains(&event.retry_count),
            "event {} has retry_count {} outside 0..={MAX_RETRIES}",
            event.id,
            event.retry_count
        );
        Ok(())
    }

    /// `published_at` and `failed_at` are never both set.
    pub fn terminal_timestamps_exclusive(event: &OutboxEvent) -> Result<()> {
        ensure!(
            !(event.published_at.is_some() && event.failed_at.is_some()),
            "event {} is both published and failed",
            event.id
        );
        Ok(())
    }

    /// Status agrees with the terminal timestamps.
    pub fn status_matches_timestamps(event: &OutboxEvent) -> Result<()> {
        let consistent = match event.status {
            EventStatus::Pending => event.published_at.is_none() && event.failed_at.is_none(),
            EventStatus::Published => event.published_at.is_some() && event.failed_at.is_none(),
            EventStatus::Failed => event.failed_at.is_some() && event.published_at.is_none(),
        };
        ensure!(
            consistent,
            "event {} has status {} but published_at={:?} failed_at={:?}",
            event.id,
            event.status,
            event.published_at,
            event.failed_at
        );
        Ok(())
    }

    /// Failed events have spent their whole retry budget.
    pub fn failed_only_after_exhaustion(event: &OutboxEvent) -> Result<()> {
        if event.status == EventStatus::Failed {
            ensure!(
                event.retry_count == MAX_RETRIES,
                "event {} failed after only {} attempts",
                event.id,
                event.retry_count
            );
        }
        Ok(())
    }

    /// Runs every per-event invariant over `events`.
    pub fn check_all(events: &[OutboxEvent]) -> Result<()> {
        for event in events {
            Self::retry_count_bounded(event)?;
            Self::terminal_timestamps_exclusive(event)?;
            Self::status_matches_timestamps(event)?;
            Self::failed_only_after_exhaustion(event)?;
        }
        Ok(())
    }

    /// No event id appears in more than one batch.
    pub fn batches_disjoint(batches: &[Vec<OutboxEvent>]) -> Result<()> {
        let mut seen: HashSet<EventId> = HashSet::new();
        for (index, batch) in batches.iter().enumerate() {
            for event in batch {
                ensure!(
                    seen.insert(event.id),
                    "event {} returned again in batch {index}",
                    event.id
                );
            }
        }
        Ok(())
    }
}
