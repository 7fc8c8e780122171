//! Scheduler adapters running the dispatcher and cleaner as recurring jobs.

use std::sync::Arc;

use courier_core::EventStore;
use courier_scheduler::{BoxError, Job, JobContext};
use futures_util::future::BoxFuture;
use tracing::debug;

use crate::{cleaner::Cleaner, dispatcher::Dispatcher, publisher::MessagePublisher};

/// Job name of the dispatcher.
pub const DISPATCH_JOB: &str = "outbox-dispatcher";
/// Job name of the cleaner.
pub const CLEANUP_JOB: &str = "outbox-cleaner";

/// Share of the run's remaining time held back for the final commit.
const COMMIT_RESERVE_DIVISOR: u32 = 10;

/// Runs one dispatch batch per trigger, bounded by the run's timeout.
pub struct DispatchJob<S, P> {
    dispatcher: Arc<Dispatcher<S, P>>,
    schedule: String,
}

impl<S, P> DispatchJob<S, P> {
    /// Creates the job with a schedule such as `@every 5s`.
    pub fn new(dispatcher: Arc<Dispatcher<S, P>>, schedule: impl Into<String>) -> Self {
        Self { dispatcher, schedule: schedule.into() }
    }
}

impl<S, P> Job for DispatchJob<S, P>
where
    S: EventStore + 'static,
    P: MessagePublisher + 'static,
{
    fn name(&self) -> &str {
        DISPATCH_JOB
    }

    fn schedule(&self) -> &str {
        &self.schedule
    }

    fn run(&self, ctx: JobContext) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            let budget = ctx.remaining().saturating_sub(ctx.remaining() / COMMIT_RESERVE_DIVISOR);
            let published =
                self.dispatcher.dispatch_within(ctx.cancellation_token(), budget).await?;
            debug!(
                job = ctx.job_name(),
                run_id = %ctx.run_id(),
                published,
                "dispatch job finished"
            );
            Ok(())
        })
    }
}

/// Runs one retention sweep per trigger.
pub struct CleanupJob<S> {
    cleaner: Arc<Cleaner<S>>,
    schedule: String,
}

impl<S> CleanupJob<S> {
    /// Creates the job with a schedule such as `@daily`.
    pub fn new(cleaner: Arc<Cleaner<S>>, schedule: impl Into<String>) -> Self {
        Self { cleaner, schedule: schedule.into() }
    }
}

impl<S> Job for CleanupJob<S>
where
    S: EventStore + 'static,
{
    fn name(&self) -> &str {
        CLEANUP_JOB
    }

    fn schedule(&self) -> &str {
        &self.schedule
    }

    fn run(&self, ctx: JobContext) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            let removed = self.cleaner.cleanup().await?;
            debug!(run_id = %ctx.run_id(), removed, "cleanup job finished");
            Ok(())
        })
    }
}
