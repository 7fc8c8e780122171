//! Recurring job scheduler.
//!
//! Triggers registered [`Job`]s on cron-like schedules with per-job
//! concurrency caps, run timeouts, panic containment and a graceful shutdown
//! that waits for in-flight runs up to a deadline.
//!
//! # Example
//!
//! ```no_run
//! use courier_scheduler::{BoxError, Job, JobContext, Scheduler, SchedulerConfig};
//! use futures_util::future::BoxFuture;
//!
//! struct Heartbeat;
//!
//! impl Job for Heartbeat {
//!     fn name(&self) -> &str {
//!         "heartbeat"
//!     }
//!
//!     fn schedule(&self) -> &str {
//!         "@every 10s"
//!     }
//!
//!     fn run(&self, _ctx: JobContext) -> BoxFuture<'_, Result<(), BoxError>> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//!
//! # async fn example() -> Result<(), courier_scheduler::SchedulerError> {
//! let scheduler = Scheduler::new(SchedulerConfig::default());
//! scheduler.register(Heartbeat)?;
//! scheduler.start()?;
//! scheduler.shutdown(std::time::Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod job;
pub mod schedule;
pub mod scheduler;

pub use error::{Result, SchedulerError};
pub use job::{BoxError, Job, JobContext};
pub use schedule::Schedule;
pub use scheduler::{RunOutcome, Scheduler, SchedulerConfig, SkipReason};
