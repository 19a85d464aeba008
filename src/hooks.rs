//! Synchronous lifecycle callbacks invoked by the worker loop.

use crate::job::Job;
use crate::store::Batch;
use std::time::Duration;

/// Observes job outcomes.
///
/// Hooks run inline on the worker task after the store operation succeeded,
/// so they should return quickly. Every method defaults to a no-op.
pub trait WorkerHooks: Send + Sync + 'static {
    /// The job succeeded and was deleted.
    fn job_acknowledged(&self, job: &Job) {
        let _ = job;
    }

    /// The job failed and will be retried after `delay`.
    fn job_released(&self, job: &Job, error: &str, delay: Duration) {
        let _ = (job, error, delay);
    }

    /// The job was moved to the failed-job store.
    fn job_failed(&self, job: &Job, error: &str) {
        let _ = (job, error);
    }

    /// The last outstanding job of `batch` reached a terminal outcome.
    fn batch_completed(&self, batch: &Batch) {
        let _ = batch;
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl WorkerHooks for NoopHooks {}
