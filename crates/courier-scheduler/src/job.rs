//! The `Job` abstraction and the context handed to each run.

use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Error type returned by job bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A unit of recurring work.
///
/// Jobs carry no persisted state. The scheduler calls [`Job::run`] once per
/// trigger, possibly concurrently up to the configured cap.
pub trait Job: Send + Sync + 'static {
    /// Unique name, used in logs and for concurrency accounting.
    fn name(&self) -> &str;

    /// Schedule expression, parsed at registration.
    fn schedule(&self) -> &str;

    /// Executes one run.
    ///
    /// Long-running bodies should watch [`JobContext::cancelled`] and return
    /// early once it fires.
    fn run(&self, ctx: JobContext) -> BoxFuture<'_, Result<(), BoxError>>;
}

/// Per-run context: identity, deadline and cooperative cancellation.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_name: Arc<str>,
    run_id: Uuid,
    deadline: Instant,
    cancellation: CancellationToken,
}

impl JobContext {
    /// Creates a context for a run that must finish within `timeout`.
    pub fn new(
        job_name: impl Into<Arc<str>>,
        timeout: Duration,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            run_id: Uuid::new_v4(),
            deadline: Instant::now() + timeout,
            cancellation,
        }
    }

    /// Name of the job this run belongs to.
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Identifier of this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Time left before the run's context is cancelled for timing out.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Token cancelled when the scheduler shuts down or the run times out.
    ///
    /// A timed-out run keeps `cancel_grace` to return after this fires.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns true once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }
}
