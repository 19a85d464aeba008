//! YAML configuration for the `workforce` binary.
//!
//! ```yaml
//! connections:
//!   main:
//!     driver: postgres
//!     url_env: DATABASE_URL
//!   cache:
//!     driver: redis
//!     url: redis://127.0.0.1/
//!     prefix: workforce
//! defaults:
//!   connection: main
//!   max_attempts: 5
//! queues:
//!   emails:
//!     connection: cache
//!     workers:
//!       timeout: 30
//!       memory_limit: 256
//!     scaling:
//!       min_workers: 1
//!       max_workers: 8
//! ```

use crate::autoscaler::ScalingPolicy;
use crate::errors::{ConfigError, QueueError};
use crate::job::{DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE};
use crate::manager::QueueManager;
use crate::process::{ProcessOptions, SupervisorOptions};
use crate::store::{DEFAULT_RETRY_AFTER, MemoryDriver, PgDriver, RedisDriver};
use crate::worker::WorkerOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Which backend a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// [`PgDriver`]
    Postgres,
    /// [`RedisDriver`]
    Redis,
    /// [`MemoryDriver`]
    Memory,
}

/// One named backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Backend.
    pub driver: DriverKind,
    /// Connection URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the URL, used when `url` is not set.
    #[serde(default)]
    pub url_env: Option<String>,
    /// Seconds a reservation is held.
    #[serde(default = "default_retry_after")]
    pub retry_after: u64,
    /// Key prefix (Redis only).
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_retry_after() -> u64 {
    DEFAULT_RETRY_AFTER.as_secs()
}

impl ConnectionConfig {
    /// The connection URL, read from `url_env` when `url` is not set.
    pub fn url(&self, name: &str) -> Result<String, ConfigError> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        match &self.url_env {
            Some(var) => std::env::var(var).map_err(|_| {
                ConfigError::Invalid(format!(
                    "connection `{name}` reads its URL from `{var}`, which is not set"
                ))
            }),
            None => Err(ConfigError::Invalid(format!(
                "connection `{name}` needs `url` or `url_env`"
            ))),
        }
    }
}

/// Values used when a job or queue does not specify its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Defaults {
    /// Connection name, the first one by name when `None`.
    pub connection: Option<String>,
    /// Queue name.
    pub queue: String,
    /// Attempts per job.
    pub max_attempts: i32,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            connection: None,
            queue: DEFAULT_QUEUE.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Worker limits, in seconds and megabytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Worker tasks per process when running in-process.
    pub concurrency: usize,
    /// Handler timeout.
    pub timeout: u64,
    /// Pause after an empty poll. Fractions of a second are allowed.
    pub sleep: f64,
    /// Resident memory ceiling.
    pub memory_limit: Option<u64>,
    /// Retire after this many jobs.
    pub max_jobs: Option<u64>,
    /// Retire after this many seconds.
    pub max_time: Option<u64>,
    /// Attempt ceiling on top of each job's own limit.
    pub tries: Option<i32>,
    /// First retry delay.
    pub backoff_base: u64,
    /// Longest retry delay.
    pub backoff_max: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let options = WorkerOptions::default();
        Self {
            concurrency: 1,
            timeout: options.timeout.as_secs(),
            sleep: options.sleep.as_secs_f64(),
            memory_limit: None,
            max_jobs: None,
            max_time: None,
            tries: None,
            backoff_base: options.backoff_base.as_secs(),
            backoff_max: options.backoff_max.as_secs(),
        }
    }
}

impl WorkerConfig {
    fn sleep_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.sleep).unwrap_or_else(|_| WorkerOptions::default().sleep)
    }

    /// Options for an in-process worker loop.
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            sleep: self.sleep_duration(),
            timeout: Duration::from_secs(self.timeout),
            max_jobs: self.max_jobs,
            max_time: self.max_time.map(Duration::from_secs),
            memory_limit_mb: self.memory_limit,
            max_attempts: self.tries,
            backoff_base: Duration::from_secs(self.backoff_base),
            backoff_max: Duration::from_secs(self.backoff_max),
            ..WorkerOptions::default()
        }
    }
}

/// Per-queue settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Connection the queue lives on.
    pub connection: Option<String>,
    /// Worker limits.
    pub workers: WorkerConfig,
    /// Auto-scaling; a fixed pool when absent.
    pub scaling: Option<ScalingPolicy>,
}

/// Supervisor timing, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// How often supervised workers report.
    pub heartbeat_interval: u64,
    /// Silence after which a worker is killed.
    pub heartbeat_grace: u64,
    /// Extra time past the handler timeout before a worker is killed.
    pub timeout_grace: u64,
    /// Unplanned restarts per queue tolerated within a minute.
    pub restart_limit: usize,
    /// How often worker health is checked.
    pub health_interval: u64,
    /// How often the auto-scaler evaluates.
    pub scale_interval: u64,
    /// How long workers get to drain on shutdown.
    pub stop_timeout: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let options = SupervisorOptions::default();
        Self {
            heartbeat_interval: 5,
            heartbeat_grace: options.heartbeat_grace.as_secs(),
            timeout_grace: options.timeout_grace.as_secs(),
            restart_limit: options.restart_limit,
            health_interval: 10,
            scale_interval: 15,
            stop_timeout: 60,
        }
    }
}

impl SupervisorConfig {
    /// Thresholds for the process manager.
    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            heartbeat_grace: Duration::from_secs(self.heartbeat_grace),
            timeout_grace: Duration::from_secs(self.timeout_grace),
            restart_limit: self.restart_limit,
            ..SupervisorOptions::default()
        }
    }
}

/// Failed-job retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FailedJobsConfig {
    /// Hours a failed job is kept.
    pub retention_hours: u64,
    /// Minutes between prune passes.
    pub prune_interval_minutes: u64,
}

impl Default for FailedJobsConfig {
    fn default() -> Self {
        Self {
            retention_hours: 24 * 7,
            prune_interval_minutes: 60,
        }
    }
}

impl FailedJobsConfig {
    /// Retention as a duration.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 60 * 60)
    }

    /// Prune interval as a duration.
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_minutes * 60)
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Named backends.
    pub connections: BTreeMap<String, ConnectionConfig>,
    /// Fallback values.
    pub defaults: Defaults,
    /// Queues the supervisor and `work` know about.
    pub queues: BTreeMap<String, QueueConfig>,
    /// Supervisor timing.
    pub supervisor: SupervisorConfig,
    /// Failed-job retention.
    pub failed_jobs: FailedJobsConfig,
}

impl Config {
    /// Read, parse and validate `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded configuration");
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross references and ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connections.is_empty() {
            return Err(ConfigError::Invalid("no connections configured".into()));
        }
        if let Some(connection) = &self.defaults.connection {
            if !self.connections.contains_key(connection) {
                return Err(ConfigError::UnknownConnection {
                    queue: "defaults".into(),
                    connection: connection.clone(),
                });
            }
        }
        if self.defaults.max_attempts < 1 {
            return Err(ConfigError::Invalid("defaults.max_attempts must be at least 1".into()));
        }
        if self.failed_jobs.retention_hours == 0 || self.failed_jobs.prune_interval_minutes == 0 {
            return Err(ConfigError::Invalid(
                "failed job retention and prune interval must be positive".into(),
            ));
        }
        if self.supervisor.heartbeat_interval == 0
            || self.supervisor.health_interval == 0
            || self.supervisor.scale_interval == 0
        {
            return Err(ConfigError::Invalid("supervisor intervals must be positive".into()));
        }
        if self.supervisor.heartbeat_grace <= self.supervisor.heartbeat_interval {
            return Err(ConfigError::Invalid(
                "supervisor.heartbeat_grace must exceed heartbeat_interval".into(),
            ));
        }

        for (name, queue) in &self.queues {
            if let Some(connection) = &queue.connection {
                if !self.connections.contains_key(connection) {
                    return Err(ConfigError::UnknownConnection {
                        queue: name.clone(),
                        connection: connection.clone(),
                    });
                }
            }
            if queue.workers.concurrency == 0 {
                return Err(ConfigError::Invalid(format!(
                    "queue `{name}`: workers.concurrency must be at least 1"
                )));
            }
            if Duration::try_from_secs_f64(queue.workers.sleep).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "queue `{name}`: workers.sleep must be a non-negative number of seconds"
                )));
            }
            if queue.workers.tries.is_some_and(|tries| tries < 1) {
                return Err(ConfigError::Invalid(format!(
                    "queue `{name}`: workers.tries must be at least 1"
                )));
            }
            if let Some(policy) = &queue.scaling {
                policy
                    .validate()
                    .map_err(|error| ConfigError::Invalid(format!("queue `{name}`: {error}")))?;
            }
        }
        Ok(())
    }

    /// Settings for `queue`, the defaults for queues not listed.
    pub fn queue(&self, queue: &str) -> QueueConfig {
        self.queues.get(queue).cloned().unwrap_or_default()
    }

    /// Limits for supervised worker processes of `queue`.
    pub fn process_options(&self, queue: &str) -> ProcessOptions {
        let config = self.queue(queue);
        let workers = &config.workers;
        ProcessOptions {
            connection: config.connection.clone(),
            memory_limit_mb: workers.memory_limit,
            timeout: Duration::from_secs(workers.timeout),
            max_jobs: workers.max_jobs,
            max_time: workers.max_time.map(Duration::from_secs),
            max_attempts: workers.tries,
            sleep: workers.sleep_duration(),
        }
    }

    /// Connect every backend and assemble a [`QueueManager`].
    pub async fn connect(&self) -> Result<QueueManager, QueueError> {
        let mut builder = QueueManager::builder()
            .default_queue(self.defaults.queue.clone())
            .default_max_attempts(self.defaults.max_attempts);
        if let Some(connection) = &self.defaults.connection {
            builder = builder.default_connection(connection.clone());
        }

        for (name, connection) in &self.connections {
            let retry_after = Duration::from_secs(connection.retry_after);
            builder = match connection.driver {
                DriverKind::Memory => {
                    builder.connection(MemoryDriver::new(name.clone()).retry_after(retry_after))
                }
                DriverKind::Postgres => {
                    let url = connection.url(name).map_err(QueueError::Config)?;
                    let driver = PgDriver::connect(&url, name.clone()).await?;
                    builder.connection(driver.retry_after(retry_after))
                }
                DriverKind::Redis => {
                    let url = connection.url(name).map_err(QueueError::Config)?;
                    let mut driver = RedisDriver::connect(&url, name.clone()).await?;
                    if let Some(prefix) = &connection.prefix {
                        driver = driver.prefix(prefix.clone());
                    }
                    builder.connection(driver.retry_after(retry_after))
                }
            };
            debug!(connection = %name, driver = ?connection.driver, "Connected");
        }

        builder.build()
    }
}
