#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod autoscaler;
mod background_job;
pub mod batch;
mod cleaner;
pub mod clock;
pub mod config;
mod errors;
pub mod hooks;
mod job;
mod job_registry;
mod manager;
pub mod process;
mod runner;
pub mod schema;
mod shell;
mod shutdown;
pub mod store;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::BackgroundJob;
pub use self::cleaner::FailedJobPruner;
pub use self::errors::{ConfigError, QueueError, StoreError};
pub use self::job::{DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE, Job, JobError, NewJob, backoff_delay};
pub use self::job_registry::JobRegistry;
pub use self::manager::{ALL_QUEUES, HealthReport, QueueManager, QueueManagerBuilder};
/// The main runner that orchestrates job processing.
pub use self::runner::{Queue, RunHandle, Runner};
pub use self::shell::ShellJob;
pub use self::shutdown::install_shutdown_handler;
pub use self::store::postgres::setup_database;
pub use self::worker::{
    CurrentJob, RetireReason, WorkerExit, WorkerOptions, WorkerState, WorkerStatus,
};
