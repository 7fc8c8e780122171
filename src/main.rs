//! Courier outbox relay.
//!
//! Runs the dispatcher and the retention cleaner as recurring jobs against
//! the service database, publishing committed outbox events to the broker.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{PostgresStore, Storage};
use courier_relay::{
    Cleaner, CleanupJob, DispatchJob, Dispatcher, ExchangeKind, HttpBroker, CLEANUP_JOB,
    DISPATCH_JOB,
};
use courier_scheduler::Scheduler;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("Starting courier outbox relay");

    let config = Config::load()?;
    info!(
        database_url = %config.database_url_masked(),
        broker_url = %config.broker_url,
        exchange = %config.broker_exchange,
        batch_size = config.outbox_batch_size,
        dispatch_schedule = %config.dispatch_schedule,
        cleanup_schedule = %config.cleanup_schedule,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    let storage = Storage::new(db_pool.clone());
    storage.migrate().await.context("Failed to run database migrations")?;
    info!("Database migrations completed");

    let broker = HttpBroker::new(config.to_broker_config())
        .context("Failed to create broker client")?;
    broker
        .declare_exchange(&config.broker_exchange, ExchangeKind::Topic)
        .await
        .context("Failed to declare outbox exchange")?;

    let store = Arc::new(PostgresStore::new(storage));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        broker,
        config.to_dispatcher_config(),
    ));
    let cleaner = Arc::new(Cleaner::new(Arc::clone(&store), config.to_cleaner_config()));

    let scheduler = Scheduler::new(config.to_scheduler_config());
    scheduler
        .register(DispatchJob::new(Arc::clone(&dispatcher), config.dispatch_schedule.clone()))
        .with_context(|| format!("Failed to register {DISPATCH_JOB}"))?;
    scheduler
        .register(CleanupJob::new(cleaner, config.cleanup_schedule.clone()))
        .with_context(|| format!("Failed to register {CLEANUP_JOB}"))?;
    scheduler.start().context("Failed to start scheduler")?;

    info!(jobs = ?scheduler.job_names(), "Courier is relaying outbox events");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    if let Err(e) = scheduler.shutdown(scheduler.config().shutdown_timeout).await {
        warn!(error = %e, "Scheduler did not drain before the deadline");
    }

    let stats = dispatcher.stats().await;
    info!(
        runs = stats.runs,
        published = stats.published,
        retried = stats.retried,
        failed = stats.failed,
        "Dispatcher totals"
    );

    db_pool.close().await;
    info!("Database connections closed");

    info!("Courier shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,courier=debug"))
        .context("Invalid RUST_LOG environment variable")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
