use crate::errors::QueueError;
use crate::job::{DEFAULT_QUEUE, JobError, NewJob};
use crate::manager::QueueManager;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tracing::instrument;

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application.
    const JOB_NAME: &'static str;

    /// Default priority of the task. Higher runs first.
    const PRIORITY: i16 = 0;

    /// Job queue where this job will be executed.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// Attempts allowed, the manager's default when `None`.
    const MAX_ATTEMPTS: Option<i32> = None;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the task. This method should define its logic.
    ///
    /// Errors converted from [`anyhow::Error`] are retryable; return
    /// [`JobError::Terminal`] to skip the remaining attempts.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = Result<(), JobError>> + Send;

    /// The envelope this job is stored as.
    fn to_new_job(&self) -> Result<NewJob, QueueError> {
        let mut job = NewJob::new(Self::JOB_NAME, serde_json::to_value(self)?)
            .on_queue(Self::QUEUE)
            .priority(Self::PRIORITY);
        job.max_attempts = Self::MAX_ATTEMPTS;
        Ok(job)
    }

    /// Enqueue this job for background execution on the default connection.
    ///
    /// Returns the job ID.
    #[instrument(name = "workforce.enqueue", skip(self, manager), fields(message = Self::JOB_NAME))]
    fn enqueue<'a>(&'a self, manager: &'a QueueManager) -> BoxFuture<'a, Result<String, QueueError>> {
        let job = match self.to_new_job() {
            Ok(job) => job,
            Err(err) => return async move { Err(err) }.boxed(),
        };
        manager.dispatch(job).boxed()
    }
}
