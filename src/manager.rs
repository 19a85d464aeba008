//! Backend-agnostic façade over the configured connections.

use crate::batch::BatchTracker;
use crate::clock::{self, Clock, to_delta};
use crate::errors::QueueError;
use crate::job::{DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE, Job, NewJob};
use crate::store::{
    Batch, BatchCallback, DistributedLock, Driver, FailedJob, FailedJobQuery, QueueStats,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Name used for [`QueueStats::queue`] when stats are aggregated.
pub const ALL_QUEUES: &str = "*";

/// Result of [`QueueManager::test_connection`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Connection that was checked.
    pub connection: String,
    /// Whether the backend answered.
    pub healthy: bool,
    /// Round-trip time of the ping.
    #[serde(rename = "latency_ms", serialize_with = "millis")]
    pub latency: Duration,
    /// Human readable outcome.
    pub message: String,
}

fn millis<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u128(value.as_millis())
}

/// Routes jobs to named connections and fills in defaults.
pub struct QueueManager {
    connections: BTreeMap<String, Arc<dyn Driver>>,
    default_connection: String,
    default_queue: String,
    default_max_attempts: i32,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("connections", &self.connections.keys().collect::<Vec<_>>())
            .field("default_connection", &self.default_connection)
            .field("default_queue", &self.default_queue)
            .field("default_max_attempts", &self.default_max_attempts)
            .finish_non_exhaustive()
    }
}

/// Builder for [`QueueManager`].
#[derive(Default)]
pub struct QueueManagerBuilder {
    connections: BTreeMap<String, Arc<dyn Driver>>,
    default_connection: Option<String>,
    default_queue: Option<String>,
    default_max_attempts: Option<i32>,
    clock: Option<Arc<dyn Clock>>,
}

impl std::fmt::Debug for QueueManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManagerBuilder")
            .field("connections", &self.connections.keys().collect::<Vec<_>>())
            .field("default_connection", &self.default_connection)
            .finish_non_exhaustive()
    }
}

impl QueueManagerBuilder {
    /// Add a connection, named after [`Driver::connection_name`].
    pub fn connection(self, driver: impl Driver + 'static) -> Self {
        self.shared_connection(Arc::new(driver))
    }

    /// Add a connection that is shared with other components.
    pub fn shared_connection(mut self, driver: Arc<dyn Driver>) -> Self {
        self.connections
            .insert(driver.connection_name().to_string(), driver);
        self
    }

    /// Connection used when callers do not name one. Defaults to the first
    /// connection by name.
    pub fn default_connection(mut self, name: impl Into<String>) -> Self {
        self.default_connection = Some(name.into());
        self
    }

    /// Queue used when a job does not name one.
    pub fn default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = Some(queue.into());
        self
    }

    /// Attempts allowed when a job does not say otherwise.
    pub fn default_max_attempts(mut self, max_attempts: i32) -> Self {
        self.default_max_attempts = Some(max_attempts);
        self
    }

    /// Clock used to timestamp new jobs.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Finish the manager.
    pub fn build(self) -> Result<QueueManager, QueueError> {
        let default_connection = match self.default_connection {
            Some(name) if self.connections.contains_key(&name) => name,
            Some(name) => return Err(QueueError::UnknownConnection(name)),
            None => self
                .connections
                .keys()
                .next()
                .cloned()
                .ok_or_else(|| QueueError::UnknownConnection("default".into()))?,
        };

        Ok(QueueManager {
            connections: self.connections,
            default_connection,
            default_queue: self.default_queue.unwrap_or_else(|| DEFAULT_QUEUE.into()),
            default_max_attempts: self
                .default_max_attempts
                .unwrap_or(DEFAULT_MAX_ATTEMPTS)
                .max(1),
            clock: self.clock.unwrap_or_else(clock::system),
        })
    }
}

impl QueueManager {
    /// Start building a manager.
    pub fn builder() -> QueueManagerBuilder {
        QueueManagerBuilder::default()
    }

    /// The driver behind `connection`, or the default connection.
    pub fn driver(&self, connection: Option<&str>) -> Result<&Arc<dyn Driver>, QueueError> {
        let name = connection.unwrap_or(&self.default_connection);
        self.connections
            .get(name)
            .ok_or_else(|| QueueError::UnknownConnection(name.to_string()))
    }

    /// Names of every configured connection.
    pub fn connection_names(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }

    /// Name of the default connection.
    pub fn default_connection(&self) -> &str {
        &self.default_connection
    }

    /// Name of the default queue.
    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    /// The manager's clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The distributed lock of `connection`.
    pub fn lock(&self, connection: Option<&str>) -> Result<Arc<dyn DistributedLock>, QueueError> {
        Ok(self.driver(connection)?.lock())
    }

    /// Batch tracker bound to `connection`.
    pub fn batches(&self, connection: Option<&str>) -> Result<BatchTracker, QueueError> {
        Ok(BatchTracker::new(
            self.driver(connection)?.clone(),
            self.default_queue.clone(),
            self.default_max_attempts,
            self.clock.clone(),
        ))
    }

    fn materialize(&self, job: NewJob) -> Job {
        job.into_job(
            self.clock.now(),
            &self.default_queue,
            self.default_max_attempts,
        )
    }

    /// Enqueue `handler` with `payload` for immediate execution.
    pub async fn push(
        &self,
        handler: &str,
        payload: Value,
        queue: Option<&str>,
        connection: Option<&str>,
    ) -> Result<String, QueueError> {
        self.later(Duration::ZERO, handler, payload, queue, connection)
            .await
    }

    /// Enqueue `handler` with `payload`, hidden for `delay`.
    pub async fn later(
        &self,
        delay: Duration,
        handler: &str,
        payload: Value,
        queue: Option<&str>,
        connection: Option<&str>,
    ) -> Result<String, QueueError> {
        let mut job = NewJob::new(handler, payload).delay(delay);
        job.queue = queue.map(str::to_string);
        self.dispatch_to(connection, job).await
    }

    /// Enqueue a fully described job on the default connection.
    pub async fn dispatch(&self, job: NewJob) -> Result<String, QueueError> {
        self.dispatch_to(None, job).await
    }

    /// Enqueue a fully described job on `connection`.
    #[instrument(skip_all, fields(job.handler = %job.handler))]
    pub async fn dispatch_to(
        &self,
        connection: Option<&str>,
        job: NewJob,
    ) -> Result<String, QueueError> {
        let driver = self.driver(connection)?;
        let job = self.materialize(job);
        debug!(job.id = %job.id, queue = %job.queue, "Enqueueing job");
        Ok(driver.enqueue(job).await?)
    }

    /// Enqueue many jobs. Equivalent to pushing them one by one, in order.
    pub async fn bulk(
        &self,
        jobs: Vec<NewJob>,
        connection: Option<&str>,
    ) -> Result<Vec<String>, QueueError> {
        let driver = self.driver(connection)?;
        let jobs = jobs.into_iter().map(|job| self.materialize(job)).collect();
        Ok(driver.bulk_enqueue(jobs).await?)
    }

    /// Counts for `queue`, or summed over every live queue when `None`.
    pub async fn stats(
        &self,
        queue: Option<&str>,
        connection: Option<&str>,
    ) -> Result<QueueStats, QueueError> {
        let driver = self.driver(connection)?;
        if let Some(queue) = queue {
            return Ok(driver.stats(queue).await?);
        }

        let mut total = QueueStats {
            queue: ALL_QUEUES.to_string(),
            ..QueueStats::default()
        };
        let mut waited = 0.0;
        for queue in driver.queues().await? {
            let stats = driver.stats(&queue).await?;
            total.total += stats.total;
            total.pending += stats.pending;
            total.reserved += stats.reserved;
            total.delayed += stats.delayed;
            total.failed += stats.failed;
            waited += stats.avg_wait_secs * stats.pending as f64;
        }
        if total.pending > 0 {
            total.avg_wait_secs = waited / total.pending as f64;
        }
        Ok(total)
    }

    /// Probe `connection`. Backend failures are reported, not returned.
    pub async fn test_connection(
        &self,
        connection: Option<&str>,
    ) -> Result<HealthReport, QueueError> {
        let driver = self.driver(connection)?;
        let started = Instant::now();
        let result = driver.ping().await;
        let latency = started.elapsed();

        let (healthy, message) = match result {
            Ok(()) => (true, format!("{} connection is healthy", driver.kind())),
            Err(error) => {
                warn!(connection = %driver.connection_name(), %error, "Health check failed");
                (false, error.to_string())
            }
        };

        Ok(HealthReport {
            connection: driver.connection_name().to_string(),
            healthy,
            latency,
            message,
        })
    }

    /// Failed jobs on `connection`, newest first.
    pub async fn failed_jobs(
        &self,
        query: &FailedJobQuery,
        connection: Option<&str>,
    ) -> Result<Vec<FailedJob>, QueueError> {
        Ok(self.driver(connection)?.failed_jobs(query).await?)
    }

    /// Put a failed job back on its queue with a fresh attempt count.
    pub async fn retry_failed(
        &self,
        id: &str,
        connection: Option<&str>,
    ) -> Result<Option<String>, QueueError> {
        Ok(self.driver(connection)?.retry_failed(id).await?)
    }

    /// Delete a failed-job record.
    pub async fn forget_failed(
        &self,
        id: &str,
        connection: Option<&str>,
    ) -> Result<bool, QueueError> {
        Ok(self.driver(connection)?.forget_failed(id).await?)
    }

    /// Delete failed-job records older than `older_than`.
    pub async fn prune_failed(
        &self,
        older_than: Duration,
        connection: Option<&str>,
    ) -> Result<u64, QueueError> {
        let before = self.clock.now() - to_delta(older_than);
        Ok(self.driver(connection)?.prune_failed(before).await?)
    }

    /// Enqueue `jobs` as one batch; `then` is dispatched once all of them
    /// reached a terminal outcome.
    pub async fn dispatch_batch(
        &self,
        name: Option<String>,
        jobs: Vec<NewJob>,
        then: Option<BatchCallback>,
        connection: Option<&str>,
    ) -> Result<Batch, QueueError> {
        if jobs.is_empty() {
            return Err(QueueError::EmptyBatch);
        }

        let driver = self.driver(connection)?;
        let mut batch = self.batches(connection)?.create_batch(name, then).await?;

        // The total must be in place before any job can finish.
        let count = i64::try_from(jobs.len()).unwrap_or(i64::MAX);
        driver.add_batch_jobs(&batch.id, count).await?;
        batch.total_jobs = count;

        let jobs = jobs
            .into_iter()
            .map(|mut job| {
                job.batch_id = Some(batch.id.clone());
                self.materialize(job)
            })
            .collect();
        driver.bulk_enqueue(jobs).await?;

        debug!(batch.id = %batch.id, jobs = count, "Dispatched batch");
        Ok(batch)
    }

    /// Look up a batch.
    pub async fn batch(
        &self,
        id: &str,
        connection: Option<&str>,
    ) -> Result<Option<Batch>, QueueError> {
        Ok(self.driver(connection)?.find_batch(id).await?)
    }
}
