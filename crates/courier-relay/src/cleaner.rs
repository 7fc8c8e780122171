//! Retention sweep for terminal outbox rows.
//!
//! Published rows older than the retention window are hard-deleted. Failed
//! rows are kept for operators unless a separate failed retention is set.
//! Pending rows are never touched.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{Clock, EventStore, RealClock};
use tracing::{info, info_span, Instrument};

use crate::error::{RelayError, Result};

/// Default retention for published rows.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Cleaner settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanerConfig {
    /// Published rows older than this are deleted.
    pub retention: Duration,

    /// Failed rows older than this are deleted; `None` keeps them forever.
    pub failed_retention: Option<Duration>,

    /// Count candidates without deleting.
    pub dry_run: bool,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self { retention: DEFAULT_RETENTION, failed_retention: None, dry_run: false }
    }
}

/// Result of one cleanup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Published rows deleted, or that would be in dry-run mode.
    pub published: u64,
    /// Failed rows deleted, or that would be in dry-run mode.
    pub failed: u64,
    /// True when nothing was actually deleted.
    pub dry_run: bool,
}

impl CleanupReport {
    /// Rows deleted (or counted) across both categories.
    pub fn total(&self) -> u64 {
        self.published + self.failed
    }
}

/// Deletes terminal outbox rows past their retention window.
pub struct Cleaner<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: CleanerConfig,
}

impl<S: EventStore> Cleaner<S> {
    /// Creates a cleaner using the system clock.
    pub fn new(store: Arc<S>, config: CleanerConfig) -> Self {
        Self::with_clock(store, config, Arc::new(RealClock::new()))
    }

    /// Creates a cleaner with an explicit clock.
    pub fn with_clock(store: Arc<S>, config: CleanerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock, config }
    }

    /// Cleaner configuration.
    pub fn config(&self) -> &CleanerConfig {
        &self.config
    }

    /// Runs one sweep and returns the number of rows deleted (or counted in
    /// dry-run mode).
    ///
    /// # Errors
    ///
    /// Returns an error if a retention window overflows the clock or the
    /// store fails.
    pub async fn cleanup(&self) -> Result<u64> {
        Ok(self.run().await?.total())
    }

    /// Runs one sweep and returns per-category counts.
    ///
    /// # Errors
    ///
    /// Same as [`Cleaner::cleanup`].
    pub async fn run(&self) -> Result<CleanupReport> {
        let span = info_span!("outbox_cleanup", dry_run = self.config.dry_run);
        self.sweep().instrument(span).await
    }

    async fn sweep(&self) -> Result<CleanupReport> {
        let now = self.clock.now_utc();
        let mut report = CleanupReport { dry_run: self.config.dry_run, ..Default::default() };

        let cutoff = retention_cutoff(now, self.config.retention)?;
        report.published = if self.config.dry_run {
            self.store.count_published_before(cutoff).await?
        } else {
            self.store.delete_published_before(cutoff).await?
        };

        if let Some(failed_retention) = self.config.failed_retention {
            let failed_cutoff = retention_cutoff(now, failed_retention)?;
            report.failed = if self.config.dry_run {
                self.store.count_failed_before(failed_cutoff).await?
            } else {
                self.store.delete_failed_before(failed_cutoff).await?
            };
        }

        if report.dry_run {
            info!(
                published = report.published,
                failed = report.failed,
                %cutoff,
                "dry run: rows eligible for cleanup"
            );
        } else {
            info!(
                published = report.published,
                failed = report.failed,
                %cutoff,
                "cleanup completed"
            );
        }

        Ok(report)
    }
}

fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
        .ok_or_else(|| RelayError::Configuration(format!("retention {retention:?} is too large")))
}
