//! Lifecycle tests for the recurring job scheduler.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use courier_scheduler::{
    BoxError, Job, JobContext, RunOutcome, Scheduler, SchedulerConfig, SchedulerError, SkipReason,
};
use futures_util::future::BoxFuture;
use tokio::sync::Notify;

struct FnJob<F> {
    name: &'static str,
    schedule: &'static str,
    body: F,
}

impl<F, Fut> Job for FnJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn name(&self) -> &str {
        self.name
    }

    fn schedule(&self) -> &str {
        self.schedule
    }

    fn run(&self, ctx: JobContext) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin((self.body)(ctx))
    }
}

fn job<F, Fut>(name: &'static str, body: F) -> FnJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    FnJob { name, schedule: "@hourly", body }
}

fn config(job_timeout: Duration, max_concurrent_runs: usize) -> SchedulerConfig {
    SchedulerConfig {
        job_timeout,
        cancel_grace: Duration::from_millis(200),
        max_concurrent_runs,
        shutdown_timeout: Duration::from_secs(1),
    }
}

async fn wait_for_running(scheduler: &Scheduler, name: &str, expected: usize) {
    for _ in 0..200 {
        if scheduler.running_count(name).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {name} never reached {expected} running instance(s)");
}

#[tokio::test]
async fn register_rejects_invalid_schedule() {
    let scheduler = Scheduler::new(SchedulerConfig::default());
    let bad = FnJob { name: "bad", schedule: "every five seconds", body: |_| async { Ok(()) } };

    let err = scheduler.register(bad).unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidSchedule { .. }));
    assert!(scheduler.job_names().is_empty());
}

#[tokio::test]
async fn register_rejects_duplicate_names() {
    let scheduler = Scheduler::new(SchedulerConfig::default());
    scheduler.register(job("outbox", |_| async { Ok(()) })).unwrap();

    let err = scheduler.register(job("outbox", |_| async { Ok(()) })).unwrap_err();
    assert_eq!(err, SchedulerError::DuplicateJob("outbox".to_string()));
}

#[tokio::test]
async fn trigger_reports_each_outcome() {
    let scheduler = Scheduler::new(config(Duration::from_secs(5), 10));
    scheduler.register(job("ok", |_| async { Ok(()) })).unwrap();
    scheduler
        .register(job("err", |_| async { Err::<(), BoxError>("broker unavailable".into()) }))
        .unwrap();

    assert_eq!(scheduler.trigger("ok").await.unwrap(), RunOutcome::Completed);
    assert_eq!(
        scheduler.trigger("err").await.unwrap(),
        RunOutcome::Failed("broker unavailable".to_string())
    );
    assert_eq!(
        scheduler.trigger("missing").await.unwrap_err(),
        SchedulerError::UnknownJob("missing".to_string())
    );
}

#[tokio::test]
async fn panicking_job_is_contained() {
    let scheduler = Scheduler::new(config(Duration::from_secs(5), 10));
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    scheduler
        .register(job("flaky", move |_| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    panic!("first run explodes");
                }
                Ok(())
            }
        }))
        .unwrap();

    let first = scheduler.trigger("flaky").await.unwrap();
    assert_eq!(first, RunOutcome::Panicked("first run explodes".to_string()));

    let second = scheduler.trigger("flaky").await.unwrap();
    assert_eq!(second, RunOutcome::Completed);
    assert_eq!(scheduler.running_count("flaky").await, 0);
}

#[tokio::test]
async fn slow_run_times_out() {
    let scheduler = Scheduler::new(config(Duration::from_millis(50), 10));
    scheduler
        .register(job("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }))
        .unwrap();

    assert_eq!(scheduler.trigger("slow").await.unwrap(), RunOutcome::TimedOut);
    assert_eq!(scheduler.running_count("slow").await, 0);
}

#[tokio::test]
async fn timed_out_run_sees_cancellation_before_it_is_dropped() {
    let scheduler = Scheduler::new(config(Duration::from_millis(50), 10));
    let wound_down = Arc::new(AtomicBool::new(false));
    let flag = wound_down.clone();
    scheduler
        .register(job("cooperative", move |ctx| {
            let flag = flag.clone();
            async move {
                assert!(ctx.remaining() <= Duration::from_millis(50));
                ctx.cancelled().await;
                assert!(ctx.is_cancelled());
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        }))
        .unwrap();

    assert_eq!(scheduler.trigger("cooperative").await.unwrap(), RunOutcome::TimedOut);
    assert!(wound_down.load(Ordering::SeqCst), "run was dropped before observing cancel");
    assert_eq!(scheduler.running_count("cooperative").await, 0);
}

#[tokio::test]
async fn concurrency_cap_skips_extra_runs() {
    let scheduler = Scheduler::new(config(Duration::from_secs(5), 1));
    let release = Arc::new(Notify::new());
    let gate = release.clone();
    scheduler
        .register(job("dispatch", move |_| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(())
            }
        }))
        .unwrap();

    let background = scheduler.clone();
    let first = tokio::spawn(async move { background.trigger("dispatch").await });
    wait_for_running(&scheduler, "dispatch", 1).await;

    let second = scheduler.trigger("dispatch").await.unwrap();
    assert_eq!(second, RunOutcome::Skipped(SkipReason::ConcurrencyLimit));

    release.notify_one();
    assert_eq!(first.await.unwrap().unwrap(), RunOutcome::Completed);
}

#[tokio::test]
async fn shutdown_waits_for_cooperative_runs() {
    let scheduler = Scheduler::new(config(Duration::from_secs(5), 10));
    let observed = Arc::new(AtomicUsize::new(0));
    let seen = observed.clone();
    scheduler
        .register(job("cleanup", move |ctx| {
            let seen = seen.clone();
            async move {
                ctx.cancelled().await;
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
        .unwrap();

    let background = scheduler.clone();
    let run = tokio::spawn(async move { background.trigger("cleanup").await });
    wait_for_running(&scheduler, "cleanup", 1).await;

    scheduler.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert_eq!(run.await.unwrap().unwrap(), RunOutcome::Completed);
}

#[tokio::test]
async fn shutdown_reports_runs_past_deadline() {
    let scheduler = Scheduler::new(config(Duration::from_secs(5), 10));
    scheduler
        .register(job("stubborn", |_| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        }))
        .unwrap();

    let background = scheduler.clone();
    let _run = tokio::spawn(async move { background.trigger("stubborn").await });
    wait_for_running(&scheduler, "stubborn", 1).await;

    let err = scheduler.shutdown(Duration::from_millis(20)).await.unwrap_err();
    assert_eq!(err, SchedulerError::ShutdownTimeout { running: 1 });
}

#[tokio::test]
async fn runs_after_shutdown_are_skipped() {
    let scheduler = Scheduler::new(SchedulerConfig::default());
    scheduler.register(job("late", |_| async { Ok(()) })).unwrap();

    scheduler.shutdown(Duration::from_millis(100)).await.unwrap();

    let outcome = scheduler.trigger("late").await.unwrap();
    assert_eq!(outcome, RunOutcome::Skipped(SkipReason::ShuttingDown));
    assert!(scheduler.is_shutting_down());
}

#[tokio::test]
async fn start_triggers_jobs_on_schedule() {
    let scheduler = Scheduler::new(config(Duration::from_secs(5), 10));
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = ticks.clone();
    scheduler
        .register(FnJob {
            name: "ticker",
            schedule: "@every 20ms",
            body: move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        })
        .unwrap();

    scheduler.start().unwrap();
    assert_eq!(scheduler.start().unwrap_err(), SchedulerError::AlreadyStarted);

    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.shutdown(Duration::from_secs(1)).await.unwrap();

    let fired = ticks.load(Ordering::SeqCst);
    assert!(fired >= 2, "expected at least two ticks, got {fired}");

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), fired, "no ticks after shutdown");
}
