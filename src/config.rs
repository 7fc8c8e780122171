//! Configuration for the courier relay process.

use std::time::Duration;

use anyhow::{Context, Result};
use courier_core::BackoffTable;
use courier_relay::{BrokerConfig, CleanerConfig, DispatcherConfig};
use courier_scheduler::{Schedule, SchedulerConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "courier.toml";
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Relay configuration with defaults, file, and environment overrides.
///
/// Loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`courier.toml`)
/// 3. Built-in defaults (lowest priority)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Maximum number of pooled connections.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    // Broker
    /// Management API base URL.
    ///
    /// Environment variable: `BROKER_URL`
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Environment variable: `BROKER_VHOST`
    #[serde(default = "default_broker_vhost")]
    pub broker_vhost: String,
    /// Exchange outbox events are published to.
    ///
    /// Environment variable: `BROKER_EXCHANGE`
    #[serde(default = "default_broker_exchange")]
    pub broker_exchange: String,
    /// Environment variable: `BROKER_USERNAME`
    #[serde(default = "default_broker_credential")]
    pub broker_username: String,
    /// Environment variable: `BROKER_PASSWORD`
    #[serde(default = "default_broker_credential")]
    pub broker_password: String,
    /// Per-request timeout, also the per-publish bound in the dispatcher.
    ///
    /// Environment variable: `BROKER_TIMEOUT_SECONDS`
    #[serde(default = "default_broker_timeout")]
    pub broker_timeout_seconds: u64,

    // Outbox
    /// Events locked and published per dispatch run.
    ///
    /// Environment variable: `OUTBOX_BATCH_SIZE`
    #[serde(default = "default_batch_size")]
    pub outbox_batch_size: usize,
    /// Advisory delays after the first, second... failure.
    ///
    /// Environment variable: `OUTBOX_BACKOFF_SECONDS`, e.g. `[30, 120]`
    #[serde(default = "default_backoff")]
    pub outbox_backoff_seconds: Vec<u64>,
    /// Environment variable: `OUTBOX_RETENTION_DAYS`
    #[serde(default = "default_retention_days")]
    pub outbox_retention_days: u64,
    /// Unset keeps failed rows until an operator acts.
    ///
    /// Environment variable: `OUTBOX_FAILED_RETENTION_DAYS`
    #[serde(default)]
    pub outbox_failed_retention_days: Option<u64>,
    /// Environment variable: `OUTBOX_CLEANUP_DRY_RUN`
    #[serde(default)]
    pub outbox_cleanup_dry_run: bool,

    // Scheduler
    /// Environment variable: `DISPATCH_SCHEDULE`
    #[serde(default = "default_dispatch_schedule")]
    pub dispatch_schedule: String,
    /// Environment variable: `CLEANUP_SCHEDULE`
    #[serde(default = "default_cleanup_schedule")]
    pub cleanup_schedule: String,
    /// Environment variable: `JOB_TIMEOUT_SECONDS`
    #[serde(default = "default_job_timeout")]
    pub job_timeout_seconds: u64,
    /// Time a timed-out run gets to honour cancellation before it is dropped.
    ///
    /// Environment variable: `JOB_CANCEL_GRACE_SECONDS`
    #[serde(default = "default_cancel_grace")]
    pub job_cancel_grace_seconds: u64,
    /// Environment variable: `JOB_MAX_CONCURRENT_RUNS`
    #[serde(default = "default_max_concurrent_runs")]
    pub job_max_concurrent_runs: usize,
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

impl Config {
    /// Loads and validates configuration from all sources.
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    /// Layered configuration sources.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Dispatcher settings.
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            batch_size: self.outbox_batch_size,
            publish_timeout: Duration::from_secs(self.broker_timeout_seconds),
            backoff: BackoffTable::from_secs(&self.outbox_backoff_seconds),
        }
    }

    /// Cleaner settings.
    pub fn to_cleaner_config(&self) -> CleanerConfig {
        CleanerConfig {
            retention: days(self.outbox_retention_days),
            failed_retention: self.outbox_failed_retention_days.map(days),
            dry_run: self.outbox_cleanup_dry_run,
        }
    }

    /// Scheduler settings.
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            job_timeout: Duration::from_secs(self.job_timeout_seconds),
            cancel_grace: Duration::from_secs(self.job_cancel_grace_seconds),
            max_concurrent_runs: self.job_max_concurrent_runs,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// Broker client settings.
    pub fn to_broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            url: self.broker_url.clone(),
            vhost: self.broker_vhost.clone(),
            exchange: self.broker_exchange.clone(),
            username: self.broker_username.clone(),
            password: self.broker_password.clone(),
            timeout: Duration::from_secs(self.broker_timeout_seconds),
        }
    }

    /// Database URL with the password replaced, for logs.
    ///
    /// Only the userinfo between `://` and `@` is inspected, so a URL without
    /// a password is returned unchanged.
    pub fn database_url_masked(&self) -> String {
        let url = &self.database_url;
        let authority_start = url.find("://").map_or(0, |pos| pos + 3);
        let authority_end = url[authority_start..]
            .find('/')
            .map_or(url.len(), |pos| authority_start + pos);
        let authority = &url[authority_start..authority_end];

        if let Some(at_pos) = authority.rfind('@') {
            if let Some(colon_pos) = authority[..at_pos].find(':') {
                let mut masked = url.clone();
                masked.replace_range(
                    authority_start + colon_pos + 1..authority_start + at_pos,
                    "***",
                );
                return masked;
            }
        }
        url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.outbox_batch_size == 0 {
            anyhow::bail!("outbox_batch_size must be greater than 0");
        }

        if self.outbox_backoff_seconds.is_empty() {
            anyhow::bail!("outbox_backoff_seconds must list at least one delay");
        }

        if self.outbox_retention_days == 0 {
            anyhow::bail!("outbox_retention_days must be greater than 0");
        }

        if self.job_max_concurrent_runs == 0 {
            anyhow::bail!("job_max_concurrent_runs must be greater than 0");
        }

        if self.job_timeout_seconds == 0 {
            anyhow::bail!("job_timeout_seconds must be greater than 0");
        }

        Schedule::parse(&self.dispatch_schedule).context("invalid dispatch_schedule")?;
        Schedule::parse(&self.cleanup_schedule).context("invalid cleanup_schedule")?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            broker_url: default_broker_url(),
            broker_vhost: default_broker_vhost(),
            broker_exchange: default_broker_exchange(),
            broker_username: default_broker_credential(),
            broker_password: default_broker_credential(),
            broker_timeout_seconds: default_broker_timeout(),
            outbox_batch_size: default_batch_size(),
            outbox_backoff_seconds: default_backoff(),
            outbox_retention_days: default_retention_days(),
            outbox_failed_retention_days: None,
            outbox_cleanup_dry_run: false,
            dispatch_schedule: default_dispatch_schedule(),
            cleanup_schedule: default_cleanup_schedule(),
            job_timeout_seconds: default_job_timeout(),
            job_cancel_grace_seconds: default_cancel_grace(),
            job_max_concurrent_runs: default_max_concurrent_runs(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
        }
    }
}

fn days(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(SECONDS_PER_DAY))
}

fn default_database_url() -> String {
    "postgresql://localhost/courier".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_broker_url() -> String {
    "http://localhost:15672".to_string()
}

fn default_broker_vhost() -> String {
    "/".to_string()
}

fn default_broker_exchange() -> String {
    "domain.events".to_string()
}

fn default_broker_credential() -> String {
    "guest".to_string()
}

fn default_broker_timeout() -> u64 {
    10
}

fn default_batch_size() -> usize {
    courier_relay::dispatcher::DEFAULT_BATCH_SIZE
}

fn default_backoff() -> Vec<u64> {
    vec![30, 120]
}

fn default_retention_days() -> u64 {
    90
}

fn default_dispatch_schedule() -> String {
    "@every 5s".to_string()
}

fn default_cleanup_schedule() -> String {
    "@daily".to_string()
}

fn default_job_timeout() -> u64 {
    300
}

fn default_cancel_grace() -> u64 {
    5
}

fn default_max_concurrent_runs() -> usize {
    10
}

fn default_shutdown_timeout() -> u64 {
    30
}
