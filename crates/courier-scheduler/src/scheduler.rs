//! Scheduler that triggers registered jobs on their schedules.
//!
//! Every run, whether timer-driven or requested through
//! [`Scheduler::trigger`], goes through the same guard:
//!
//! 1. skipped once shutdown has begun
//! 2. skipped while the job already has `max_concurrent_runs` runs in flight
//! 3. panics are caught and logged with the captured backtrace
//! 4. bounded by `job_timeout`: at the deadline the run's [`JobContext`] is
//!    cancelled and the run gets `cancel_grace` to wind down before it is
//!    dropped
//! 5. start, outcome and duration are logged
//!
//! Runs are tracked so [`Scheduler::shutdown`] can wait for them. Shutdown
//! only asks runs to stop through their [`JobContext`]; it never aborts them.

use std::{
    any::Any,
    backtrace::Backtrace,
    cell::RefCell,
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, Once, PoisonError,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    error::{Result, SchedulerError},
    job::{Job, JobContext},
    schedule::Schedule,
};

/// Scheduler limits shared by every registered job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound for a single run.
    pub job_timeout: Duration,

    /// How long a run that hit `job_timeout` may keep going after its
    /// context is cancelled.
    pub cancel_grace: Duration,

    /// Maximum simultaneous runs of the same job.
    pub max_concurrent_runs: usize,

    /// Default deadline used by callers of [`Scheduler::shutdown`].
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(5 * 60),
            cancel_grace: Duration::from_secs(5),
            max_concurrent_runs: 10,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Why a triggered run did not execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The scheduler is shutting down.
    ShuttingDown,
    /// The job already has the maximum number of runs in flight.
    ConcurrencyLimit,
}

/// Result of one guarded run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The job body returned `Ok`.
    Completed,
    /// The job body returned an error.
    Failed(String),
    /// The run exceeded the job timeout.
    TimedOut,
    /// The job body panicked; the panic was contained.
    Panicked(String),
    /// The run never started.
    Skipped(SkipReason),
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed(_) => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Panicked(_) => write!(f, "panicked"),
            Self::Skipped(SkipReason::ShuttingDown) => write!(f, "skipped_shutting_down"),
            Self::Skipped(SkipReason::ConcurrencyLimit) => write!(f, "skipped_concurrency_limit"),
        }
    }
}

struct Registered {
    job: Arc<dyn Job>,
    schedule: Schedule,
}

struct Inner {
    config: SchedulerConfig,
    jobs: StdMutex<HashMap<String, Arc<Registered>>>,
    /// In-flight run count per job name.
    running: Mutex<HashMap<String, usize>>,
    started: AtomicBool,
    stop_triggers: CancellationToken,
    stop_runs: CancellationToken,
    runs: TaskTracker,
}

/// Recurring job scheduler.
///
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Creates a scheduler with no jobs.
    pub fn new(config: SchedulerConfig) -> Self {
        install_panic_hook();

        Self {
            inner: Arc::new(Inner {
                config,
                jobs: StdMutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                started: AtomicBool::new(false),
                stop_triggers: CancellationToken::new(),
                stop_runs: CancellationToken::new(),
                runs: TaskTracker::new(),
            }),
        }
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Registers a job.
    ///
    /// Jobs registered after [`Scheduler::start`] begin triggering
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidSchedule` if the job's schedule does
    /// not parse and `SchedulerError::DuplicateJob` if the name is taken.
    pub fn register(&self, job: impl Job) -> Result<()> {
        self.register_arc(Arc::new(job))
    }

    /// Registers a shared job.
    ///
    /// # Errors
    ///
    /// Same as [`Scheduler::register`].
    pub fn register_arc(&self, job: Arc<dyn Job>) -> Result<()> {
        let schedule = Schedule::parse(job.schedule())?;
        let name = job.name().to_string();
        let registered = Arc::new(Registered { job, schedule });

        {
            let mut jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            if jobs.contains_key(&name) {
                return Err(SchedulerError::DuplicateJob(name));
            }
            jobs.insert(name.clone(), registered.clone());
        }

        info!(job = %name, schedule = %registered.schedule, "job registered");

        if self.inner.started.load(Ordering::Acquire) {
            spawn_trigger_loop(self.inner.clone(), registered);
        }
        Ok(())
    }

    /// Names of all registered jobs.
    pub fn job_names(&self) -> Vec<String> {
        let jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = jobs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Starts triggering registered jobs. Returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::AlreadyStarted` on a second call.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyStarted);
        }

        let registered: Vec<Arc<Registered>> = {
            let jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            jobs.values().cloned().collect()
        };

        info!(job_count = registered.len(), "scheduler starting");
        for job in registered {
            spawn_trigger_loop(self.inner.clone(), job);
        }
        Ok(())
    }

    /// Runs a registered job now through the guarded wrapper and waits for
    /// its outcome.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::UnknownJob` if no job has this name.
    pub async fn trigger(&self, name: &str) -> Result<RunOutcome> {
        let registered = self.inner.find(name)?;
        let inner = self.inner.clone();
        let handle = self.inner.runs.spawn(async move { inner.run_guarded(registered).await });

        Ok(handle.await.unwrap_or_else(|e| RunOutcome::Panicked(e.to_string())))
    }

    /// Number of in-flight runs of `name`.
    pub async fn running_count(&self, name: &str) -> usize {
        self.inner.running.lock().await.get(name).copied().unwrap_or(0)
    }

    /// Number of in-flight runs across all jobs.
    fn total_running(&self) -> usize {
        self.inner.runs.len()
    }

    /// Returns true once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.stop_triggers.is_cancelled()
    }

    /// Stops triggering, signals in-flight runs to cancel and waits for them
    /// up to `deadline`.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::ShutdownTimeout` with the number of runs
    /// still executing when the deadline elapses. Those runs keep going.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        info!(
            in_flight = self.total_running(),
            deadline_ms = deadline.as_millis() as u64,
            "scheduler shutting down"
        );

        self.inner.stop_triggers.cancel();
        self.inner.stop_runs.cancel();
        self.inner.runs.close();

        if tokio::time::timeout(deadline, self.inner.runs.wait()).await.is_ok() {
            info!("scheduler stopped");
            return Ok(());
        }

        let running = self.total_running();
        if running == 0 {
            info!("scheduler stopped");
            return Ok(());
        }

        error!(running, deadline_ms = deadline.as_millis() as u64, "scheduler shutdown timed out");
        Err(SchedulerError::ShutdownTimeout { running })
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.job_names())
            .field("config", &self.inner.config)
            .field("started", &self.inner.started.load(Ordering::Acquire))
            .finish()
    }
}

impl Inner {
    fn find(&self, name: &str) -> Result<Arc<Registered>> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.get(name).cloned().ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))
    }

    async fn run_guarded(&self, registered: Arc<Registered>) -> RunOutcome {
        let name = registered.job.name().to_string();

        if self.stop_triggers.is_cancelled() {
            info!(job = %name, "run skipped: scheduler shutting down");
            return RunOutcome::Skipped(SkipReason::ShuttingDown);
        }

        {
            let mut running = self.running.lock().await;
            let count = running.entry(name.clone()).or_insert(0);
            if *count >= self.config.max_concurrent_runs {
                info!(
                    job = %name,
                    running = *count,
                    limit = self.config.max_concurrent_runs,
                    "run skipped: concurrency limit reached"
                );
                return RunOutcome::Skipped(SkipReason::ConcurrencyLimit);
            }
            *count += 1;
        }

        let cancellation = self.stop_runs.child_token();
        let ctx = JobContext::new(name.as_str(), self.config.job_timeout, cancellation.clone());
        let span = info_span!("job_run", job = %name, run_id = %ctx.run_id());

        let outcome = async {
            info!("job run started");
            let started = Instant::now();

            let run = AssertUnwindSafe(async { registered.job.run(ctx).await }).catch_unwind();
            tokio::pin!(run);

            let result = match tokio::time::timeout(self.config.job_timeout, &mut run).await {
                Ok(result) => Some(result),
                Err(_) => {
                    cancellation.cancel();
                    warn!(
                        grace_ms = self.config.cancel_grace.as_millis() as u64,
                        "job run hit its timeout, cancelling"
                    );
                    match tokio::time::timeout(self.config.cancel_grace, &mut run).await {
                        Ok(_) => debug!("timed out run wound down after cancellation"),
                        Err(_) => warn!("timed out run ignored cancellation, dropping it"),
                    }
                    None
                },
            };

            let outcome = match result {
                Some(Ok(Ok(()))) => RunOutcome::Completed,
                Some(Ok(Err(e))) => RunOutcome::Failed(e.to_string()),
                Some(Err(payload)) => panicked(payload),
                None => RunOutcome::TimedOut,
            };

            let duration_ms = started.elapsed().as_millis() as u64;
            match &outcome {
                RunOutcome::Completed => info!(duration_ms, "job run completed"),
                RunOutcome::Failed(e) => error!(duration_ms, error = %e, "job run failed"),
                RunOutcome::TimedOut => error!(
                    duration_ms,
                    timeout_ms = self.config.job_timeout.as_millis() as u64,
                    "job run timed out"
                ),
                RunOutcome::Panicked(_) => warn!(duration_ms, "job run recovered from panic"),
                RunOutcome::Skipped(_) => {},
            }
            outcome
        }
        .instrument(span)
        .await;

        let mut running = self.running.lock().await;
        if let Some(count) = running.get_mut(&name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                running.remove(&name);
            }
        }

        outcome
    }
}

fn spawn_trigger_loop(inner: Arc<Inner>, registered: Arc<Registered>) {
    tokio::spawn(async move {
        let name = registered.job.name().to_string();
        debug!(job = %name, schedule = %registered.schedule, "trigger loop started");

        loop {
            let Some(delay) = registered.schedule.delay_from(Utc::now()) else {
                warn!(job = %name, "schedule has no further fire times");
                break;
            };

            tokio::select! {
                () = inner.stop_triggers.cancelled() => break,
                () = tokio::time::sleep(delay) => {},
            }

            let run_inner = inner.clone();
            let run_job = registered.clone();
            inner.runs.spawn(async move {
                run_inner.run_guarded(run_job).await;
            });
        }

        debug!(job = %name, "trigger loop stopped");
    });
}

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chains a hook that stashes the backtrace of the panicking thread, so the
/// run guard can log it after `catch_unwind` returns on that same thread.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

fn panicked(payload: Box<dyn Any + Send>) -> RunOutcome {
    let message = panic_message(payload.as_ref());
    let backtrace = take_panic_backtrace().unwrap_or_default();
    error!(panic = %message, backtrace = %backtrace, "job run panicked");
    RunOutcome::Panicked(message)
}

fn take_panic_backtrace() -> Option<String> {
    PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_handles_both_payload_kinds() {
        let static_payload: Box<dyn Any + Send> = Box::new("boom");
        let owned_payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other_payload: Box<dyn Any + Send> = Box::new(42u8);

        assert_eq!(panic_message(static_payload.as_ref()), "boom");
        assert_eq!(panic_message(owned_payload.as_ref()), "bang");
        assert_eq!(panic_message(other_payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn outcome_display_is_snake_case() {
        assert_eq!(RunOutcome::TimedOut.to_string(), "timed_out");
        assert_eq!(
            RunOutcome::Skipped(SkipReason::ConcurrencyLimit).to_string(),
            "skipped_concurrency_limit"
        );
    }
}
