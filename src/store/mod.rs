//! Job store drivers.
//!
//! A driver is a complete backend: the active job table ([`JobStore`]), the
//! isolated failed-job records ([`FailedJobStore`]), batch bookkeeping
//! ([`BatchStore`]) and a coarse distributed lock ([`DistributedLock`]).
//! All cross-worker coordination happens inside these operations, each of
//! which is atomic at the backend.

use crate::errors::StoreError;
use crate::job::Job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub mod postgres;
pub mod redis;

pub use self::memory::MemoryDriver;
pub use self::postgres::PgDriver;
pub use self::redis::RedisDriver;

/// Jobs inserted per statement (Postgres) or per pipeline (Redis).
pub(crate) const BULK_CHUNK_SIZE: usize = 500;

/// How long a reservation is held before the job becomes reservable again.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(90);

/// Point-in-time counts for one queue. Best effort under concurrent writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Queue name.
    pub queue: String,
    /// `pending + reserved + delayed`.
    pub total: u64,
    /// Visible and waiting for a worker.
    pub pending: u64,
    /// Held by a live reservation.
    pub reserved: u64,
    /// Waiting for their delay to pass.
    pub delayed: u64,
    /// Failed-job records for the queue.
    pub failed: u64,
    /// Mean seconds pending jobs have been visible without being picked up.
    pub avg_wait_secs: f64,
}

/// What `release` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Back on the queue, visible again at the given time.
    Requeued(DateTime<Utc>),
    /// Attempts were exhausted; the job is now a failed-job record.
    Failed,
}

/// The active job table.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist one job. Durable once this returns.
    async fn enqueue(&self, job: Job) -> Result<String, StoreError>;

    /// Persist many jobs, chunked so no single operation grows unbounded.
    async fn bulk_enqueue(&self, jobs: Vec<Job>) -> Result<Vec<String>, StoreError>;

    /// Atomically claim the next visible job on `queue`.
    ///
    /// Picks by `priority DESC, available_at ASC, creation ASC`, marks it
    /// reserved until `now + retry_after` and counts the attempt. No two
    /// concurrent callers ever receive the same job.
    async fn reserve(&self, queue: &str) -> Result<Option<Job>, StoreError>;

    /// Delete a successfully completed job.
    ///
    /// Returns false if the job was already gone, which happens when a lapsed
    /// reservation let another worker run and settle it first.
    async fn acknowledge(&self, id: &str) -> Result<bool, StoreError>;

    /// Put a reserved job back with a delay, or fail it once its attempts are
    /// used up.
    ///
    /// `job` is the job as [`reserve`](Self::reserve) returned it. Returns
    /// `None` and changes nothing if that reservation is no longer the job's
    /// current one.
    async fn release(
        &self,
        job: &Job,
        delay: Duration,
        error: &str,
    ) -> Result<Option<Released>, StoreError>;

    /// Move a reserved job to the failed-job store regardless of remaining
    /// attempts.
    ///
    /// Returns false and changes nothing if the reservation `job` was returned
    /// under is no longer the job's current one.
    async fn fail(&self, job: &Job, error: &str) -> Result<bool, StoreError>;

    /// Counts for one queue.
    async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError>;

    /// Queues that currently hold at least one job.
    async fn queues(&self) -> Result<Vec<String>, StoreError>;

    /// Cheap round trip to the backend.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// A terminally failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    /// Identifier of the failure record.
    pub id: String,
    /// The job as it was when it failed.
    pub job: Job,
    /// Connection the job ran on.
    pub connection: String,
    /// Queue the job ran on.
    pub queue: String,
    /// Description of the last error.
    pub error: String,
    /// Batch the job belonged to.
    pub batch_id: Option<String>,
    /// When the job failed.
    pub failed_at: DateTime<Utc>,
}

impl FailedJob {
    pub(crate) fn new(connection: &str, job: &Job, error: &str, failed_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job: job.clone(),
            connection: connection.to_string(),
            queue: job.queue.clone(),
            error: error.to_string(),
            batch_id: job.batch_id.clone(),
            failed_at,
        }
    }
}

/// Filter for listing failed jobs.
#[derive(Debug, Clone, Default)]
pub struct FailedJobQuery {
    /// Restrict to one queue.
    pub queue: Option<String>,
    /// Return at most this many, newest first.
    pub limit: Option<usize>,
}

/// Isolated record of terminally failed jobs.
#[async_trait]
pub trait FailedJobStore: Send + Sync {
    /// Failed jobs, newest first.
    async fn failed_jobs(&self, query: &FailedJobQuery) -> Result<Vec<FailedJob>, StoreError>;

    /// One failed job.
    async fn find_failed(&self, id: &str) -> Result<Option<FailedJob>, StoreError>;

    /// Remove the record and re-enqueue the job with a fresh attempt count.
    ///
    /// Returns the job id, or `None` if no such record exists.
    async fn retry_failed(&self, id: &str) -> Result<Option<String>, StoreError>;

    /// Delete one record. Returns whether it existed.
    async fn forget_failed(&self, id: &str) -> Result<bool, StoreError>;

    /// Delete every record that failed before `before`. Returns the count.
    async fn prune_failed(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// A job enqueued once its batch completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCallback {
    /// Handler of the completion job.
    pub handler: String,
    /// Passed to the handler as `data`.
    pub payload: Value,
    /// Queue for the completion job, the manager's default when `None`.
    pub queue: Option<String>,
}

/// A set of jobs tracked for aggregate completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Batch identifier.
    pub id: String,
    /// Optional label.
    pub name: Option<String>,
    /// Jobs enqueued under this batch.
    pub total_jobs: i64,
    /// Jobs that were acknowledged.
    pub completed_jobs: i64,
    /// Jobs that ended in the failed-job store.
    pub failed_jobs: i64,
    /// Enqueued once, when the batch completes.
    pub then: Option<BatchCallback>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Set exactly once, when `completed + failed` reaches `total`.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub(crate) fn new(name: Option<String>, then: Option<BatchCallback>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            total_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            then,
            created_at: now,
            finished_at: None,
        }
    }

    /// Jobs that have not reached a terminal outcome.
    pub fn pending_jobs(&self) -> i64 {
        self.total_jobs - self.completed_jobs - self.failed_jobs
    }

    /// Whether the completion flag has been set.
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// The result of recording one outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchProgress {
    /// The batch after the update.
    pub batch: Batch,
    /// True for exactly one caller: the one whose update completed the batch.
    pub just_finished: bool,
}

/// Batch counters with an edge-triggered completion flag.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Store a new, empty batch.
    async fn create_batch(&self, batch: Batch) -> Result<Batch, StoreError>;

    /// Reserve room for `count` more jobs. Fails once the batch finished.
    async fn add_batch_jobs(&self, id: &str, count: i64) -> Result<(), StoreError>;

    /// Count one terminal outcome and compare-and-set the completion flag.
    async fn record_batch_outcome(&self, id: &str, success: bool)
    -> Result<BatchProgress, StoreError>;

    /// Look up a batch.
    async fn find_batch(&self, id: &str) -> Result<Option<Batch>, StoreError>;
}

/// A held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Locked resource.
    pub name: String,
    /// Identifies the holder; only the holder can release.
    pub token: String,
    /// The lock lapses on its own after this instant.
    pub expires_at: DateTime<Utc>,
}

/// Coarse mutual exclusion across nodes.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take the lock for `ttl`, or `None` if someone else holds it.
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>, StoreError>;

    /// Give the lock back. Returns false if it had already lapsed.
    async fn release(&self, lease: &Lease) -> Result<bool, StoreError>;
}

/// A complete backend bound to a named connection.
pub trait Driver: JobStore + FailedJobStore + BatchStore {
    /// Name of the connection this driver serves.
    fn connection_name(&self) -> &str;

    /// Backend kind, e.g. `postgres`.
    fn kind(&self) -> &'static str;

    /// The backend's distributed lock.
    fn lock(&self) -> Arc<dyn DistributedLock>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_batch_jobs() {
        let mut batch = Batch::new(None, None, Utc::now());
        batch.total_jobs = 10;
        batch.completed_jobs = 6;
        batch.failed_jobs = 1;
        assert_eq!(batch.pending_jobs(), 3);
        assert!(!batch.is_finished());
    }
}
