//! Aggregate completion tracking for groups of jobs.

use crate::clock::Clock;
use crate::errors::QueueError;
use crate::job::NewJob;
use crate::store::{Batch, BatchCallback, Driver};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// Creates batches and records their jobs' terminal outcomes.
#[derive(Clone)]
pub struct BatchTracker {
    driver: Arc<dyn Driver>,
    default_queue: String,
    default_max_attempts: i32,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for BatchTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchTracker")
            .field("connection", &self.driver.connection_name())
            .field("default_queue", &self.default_queue)
            .finish_non_exhaustive()
    }
}

impl BatchTracker {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        default_queue: String,
        default_max_attempts: i32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            driver,
            default_queue,
            default_max_attempts,
            clock,
        }
    }

    /// Store a new, empty batch.
    pub async fn create_batch(
        &self,
        name: Option<String>,
        then: Option<BatchCallback>,
    ) -> Result<Batch, QueueError> {
        let batch = Batch::new(name, then, self.clock.now());
        Ok(self.driver.create_batch(batch).await?)
    }

    /// Count one terminal outcome.
    ///
    /// Returns the batch only to the caller whose outcome completed it; that
    /// caller also enqueues the completion job, with payload
    /// `{"batch": <batch>, "data": <callback payload>}`.
    pub async fn record_outcome(
        &self,
        batch_id: &str,
        success: bool,
    ) -> Result<Option<Batch>, QueueError> {
        let progress = self.driver.record_batch_outcome(batch_id, success).await?;
        if !progress.just_finished {
            debug!(
                batch.id = %batch_id,
                pending = progress.batch.pending_jobs(),
                "Recorded batch outcome"
            );
            return Ok(None);
        }

        let batch = progress.batch;
        info!(
            batch.id = %batch.id,
            completed = batch.completed_jobs,
            failed = batch.failed_jobs,
            "Batch finished"
        );

        if let Some(then) = &batch.then {
            let payload = json!({ "batch": batch, "data": then.payload });
            let mut job = NewJob::new(&then.handler, payload);
            job.queue = then.queue.clone();
            let job = job.into_job(
                self.clock.now(),
                &self.default_queue,
                self.default_max_attempts,
            );
            let id = self.driver.enqueue(job).await?;
            info!(batch.id = %batch.id, job.id = %id, "Dispatched batch completion job");
        }

        Ok(Some(batch))
    }

    /// Look up a batch.
    pub async fn find(&self, id: &str) -> Result<Option<Batch>, QueueError> {
        Ok(self.driver.find_batch(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::store::{BatchStore, JobStore, MemoryDriver};
    use claims::{assert_none, assert_ok, assert_some};
    use futures_util::future::join_all;

    fn tracker(driver: &MemoryDriver) -> BatchTracker {
        BatchTracker::new(
            Arc::new(driver.clone()),
            "default".into(),
            3,
            clock::system(),
        )
    }

    #[tokio::test]
    async fn completion_job_is_dispatched_once() {
        let driver = MemoryDriver::new("memory");
        let tracker = tracker(&driver);
        let then = BatchCallback {
            handler: "report".into(),
            payload: json!({"to": "ops"}),
            queue: Some("reports".into()),
        };

        let batch = assert_ok!(tracker.create_batch(Some("import".into()), Some(then)).await);
        assert_ok!(driver.add_batch_jobs(&batch.id, 8).await);

        let outcomes = (0..8).map(|i| tracker.record_outcome(&batch.id, i % 4 != 0));
        let finished: Vec<_> = join_all(outcomes)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .flatten()
            .collect();

        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].completed_jobs, 6);
        assert_eq!(finished[0].failed_jobs, 2);

        let job = assert_some!(assert_ok!(driver.reserve("reports").await));
        assert_eq!(job.handler, "report");
        assert_eq!(job.payload["data"], json!({"to": "ops"}));
        assert_eq!(job.payload["batch"]["id"], json!(batch.id));
        assert_none!(assert_ok!(driver.reserve("reports").await));
    }

    #[tokio::test]
    async fn batches_without_callback_finish_silently() {
        let driver = MemoryDriver::new("memory");
        let tracker = tracker(&driver);

        let batch = assert_ok!(tracker.create_batch(None, None).await);
        assert_ok!(driver.add_batch_jobs(&batch.id, 1).await);

        let finished = assert_some!(assert_ok!(tracker.record_outcome(&batch.id, true).await));
        assert!(finished.is_finished());
        assert_eq!(assert_ok!(driver.queues().await), Vec::<String>::new());
    }
}
