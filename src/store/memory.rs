//! In-process driver over an ordered index behind a single mutex.
//!
//! Every operation runs to completion while holding the lock, which is what
//! makes `reserve` a pop-and-mark primitive. Nothing survives the process, so
//! this backend suits tests and single-process deployments.

use super::{
    Batch, BatchProgress, BatchStore, DistributedLock, Driver, FailedJob, FailedJobQuery,
    FailedJobStore, JobStore, Lease, QueueStats, Released,
};
use crate::clock::{self, Clock, to_delta};
use crate::errors::StoreError;
use crate::job::Job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::trace;

/// Sort key of an unreserved job: priority DESC, available_at ASC, creation ASC.
type ReadyKey = (Reverse<i16>, DateTime<Utc>, u64);

#[derive(Debug, Default)]
struct QueueIndex {
    /// Jobs not currently reserved, including delayed ones.
    waiting: BTreeSet<(ReadyKey, String)>,
    /// Reserved jobs by reservation expiry.
    reserved: BTreeSet<(DateTime<Utc>, String)>,
}

#[derive(Debug)]
struct Entry {
    job: Job,
    seq: u64,
}

impl Entry {
    fn ready_key(&self) -> (ReadyKey, String) {
        (
            (Reverse(self.job.priority), self.job.available_at, self.seq),
            self.job.id.clone(),
        )
    }
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    jobs: HashMap<String, Entry>,
    queues: BTreeMap<String, QueueIndex>,
    failed: BTreeMap<String, FailedJob>,
    batches: HashMap<String, Batch>,
    locks: HashMap<String, Lease>,
}

impl State {
    fn insert(&mut self, job: Job) -> String {
        self.next_seq += 1;
        let entry = Entry {
            job,
            seq: self.next_seq,
        };
        let id = entry.job.id.clone();
        self.queues
            .entry(entry.job.queue.clone())
            .or_default()
            .waiting
            .insert(entry.ready_key());
        self.jobs.insert(id.clone(), entry);
        id
    }

    fn remove(&mut self, id: &str) -> Option<Job> {
        let entry = self.jobs.remove(id)?;
        if let Some(index) = self.queues.get_mut(&entry.job.queue) {
            index.waiting.remove(&entry.ready_key());
            if let Some(until) = entry.job.reserved_until {
                index.reserved.remove(&(until, entry.job.id.clone()));
            }
        }
        Some(entry.job)
    }

    /// Remove `job` if the stored copy still carries the reservation `job`
    /// was returned under.
    fn take_reserved(&mut self, job: &Job) -> Option<Job> {
        let held = self
            .jobs
            .get(&job.id)
            .is_some_and(|entry| entry.job.reserved_until == job.reserved_until);
        if !held {
            return None;
        }
        self.remove(&job.id)
    }

    /// Return lapsed reservations on `queue` to the waiting index.
    fn recover_expired(&mut self, queue: &str, now: DateTime<Utc>) {
        let Some(index) = self.queues.get_mut(queue) else {
            return;
        };
        let expired: Vec<_> = index
            .reserved
            .iter()
            .take_while(|(until, _)| *until < now)
            .cloned()
            .collect();
        for (until, id) in expired {
            index.reserved.remove(&(until, id.clone()));
            if let Some(entry) = self.jobs.get(&id) {
                trace!(job.id = %id, "Reservation expired");
                index.waiting.insert(entry.ready_key());
            }
        }
    }

    fn fail(&mut self, connection: &str, job: &Job, error: &str, now: DateTime<Utc>) -> bool {
        if self.take_reserved(job).is_none() {
            return false;
        }
        let failed = FailedJob::new(connection, job, error, now);
        self.failed.insert(failed.id.clone(), failed);
        true
    }
}

/// The in-memory backend.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    connection: String,
    retry_after: Duration,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<State>>,
}

impl MemoryDriver {
    /// A fresh, empty store.
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            retry_after: super::DEFAULT_RETRY_AFTER,
            clock: clock::system(),
            state: Arc::default(),
        }
    }

    /// Set how long reservations are held.
    pub fn retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Use another clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl JobStore for MemoryDriver {
    async fn enqueue(&self, job: Job) -> Result<String, StoreError> {
        Ok(self.state.lock().await.insert(job))
    }

    async fn bulk_enqueue(&self, jobs: Vec<Job>) -> Result<Vec<String>, StoreError> {
        let mut state = self.state.lock().await;
        Ok(jobs.into_iter().map(|job| state.insert(job)).collect())
    }

    async fn reserve(&self, queue: &str) -> Result<Option<Job>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.recover_expired(queue, now);

        let Some(index) = state.queues.get_mut(queue) else {
            return Ok(None);
        };
        let Some(key) = index
            .waiting
            .iter()
            .find(|((_, available_at, _), _)| *available_at <= now)
            .cloned()
        else {
            return Ok(None);
        };

        let until = now + to_delta(self.retry_after);
        index.waiting.remove(&key);
        index.reserved.insert((until, key.1.clone()));

        let entry = state
            .jobs
            .get_mut(&key.1)
            .ok_or_else(|| StoreError::Corrupt(format!("indexed job {} has no record", key.1)))?;
        entry.job.attempts += 1;
        entry.job.reserved_at = Some(now);
        entry.job.reserved_until = Some(until);
        Ok(Some(entry.job.clone()))
    }

    async fn acknowledge(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.remove(id).is_some())
    }

    async fn release(
        &self,
        reserved: &Job,
        delay: Duration,
        error: &str,
    ) -> Result<Option<Released>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(mut job) = state.take_reserved(reserved) else {
            return Ok(None);
        };

        if job.attempts_exhausted() {
            let failed = FailedJob::new(&self.connection, &job, error, now);
            state.failed.insert(failed.id.clone(), failed);
            return Ok(Some(Released::Failed));
        }

        // Re-inserting assigns a new sequence number, but `available_at`
        // already orders it behind everything that was waiting.
        job.reserved_at = None;
        job.reserved_until = None;
        job.available_at = now + to_delta(delay);
        let available_at = job.available_at;
        state.insert(job);
        Ok(Some(Released::Requeued(available_at)))
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .state
            .lock()
            .await
            .fail(&self.connection, job, error, now))
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            queue: queue.to_string(),
            ..QueueStats::default()
        };
        let mut waited = 0.0;

        for entry in state.jobs.values().filter(|e| e.job.queue == queue) {
            if entry.job.is_reserved(now) {
                stats.reserved += 1;
            } else if entry.job.is_delayed(now) {
                stats.delayed += 1;
            } else {
                stats.pending += 1;
                waited += (now - entry.job.available_at).num_milliseconds() as f64 / 1000.0;
            }
        }

        stats.total = stats.pending + stats.reserved + stats.delayed;
        stats.failed = state.failed.values().filter(|f| f.queue == queue).count() as u64;
        if stats.pending > 0 {
            stats.avg_wait_secs = waited / stats.pending as f64;
        }
        Ok(stats)
    }

    async fn queues(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .queues
            .iter()
            .filter(|(_, index)| !index.waiting.is_empty() || !index.reserved.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl FailedJobStore for MemoryDriver {
    async fn failed_jobs(&self, query: &FailedJobQuery) -> Result<Vec<FailedJob>, StoreError> {
        let state = self.state.lock().await;
        let mut failed: Vec<_> = state
            .failed
            .values()
            .filter(|f| query.queue.as_ref().is_none_or(|q| &f.queue == q))
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        if let Some(limit) = query.limit {
            failed.truncate(limit);
        }
        Ok(failed)
    }

    async fn find_failed(&self, id: &str) -> Result<Option<FailedJob>, StoreError> {
        Ok(self.state.lock().await.failed.get(id).cloned())
    }

    async fn retry_failed(&self, id: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(failed) = state.failed.remove(id) else {
            return Ok(None);
        };
        Ok(Some(state.insert(failed.job.reset_for_retry())))
    }

    async fn forget_failed(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.failed.remove(id).is_some())
    }

    async fn prune_failed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let count = state.failed.len();
        state.failed.retain(|_, f| f.failed_at >= before);
        Ok((count - state.failed.len()) as u64)
    }
}

#[async_trait]
impl BatchStore for MemoryDriver {
    async fn create_batch(&self, batch: Batch) -> Result<Batch, StoreError> {
        self.state
            .lock()
            .await
            .batches
            .insert(batch.id.clone(), batch.clone());
        Ok(batch)
    }

    async fn add_batch_jobs(&self, id: &str, count: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let batch = state
            .batches
            .get_mut(id)
            .ok_or_else(|| StoreError::BatchNotFound(id.to_string()))?;
        if batch.is_finished() {
            return Err(StoreError::BatchFinished(id.to_string()));
        }
        batch.total_jobs += count;
        Ok(())
    }

    async fn record_batch_outcome(
        &self,
        id: &str,
        success: bool,
    ) -> Result<BatchProgress, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let batch = state
            .batches
            .get_mut(id)
            .ok_or_else(|| StoreError::BatchNotFound(id.to_string()))?;

        if batch.pending_jobs() > 0 {
            if success {
                batch.completed_jobs += 1;
            } else {
                batch.failed_jobs += 1;
            }
        }

        let just_finished = batch.pending_jobs() == 0 && batch.finished_at.is_none();
        if just_finished {
            batch.finished_at = Some(now);
        }
        Ok(BatchProgress {
            batch: batch.clone(),
            just_finished,
        })
    }

    async fn find_batch(&self, id: &str) -> Result<Option<Batch>, StoreError> {
        Ok(self.state.lock().await.batches.get(id).cloned())
    }
}

#[async_trait]
impl DistributedLock for MemoryDriver {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.locks.get(name).is_some_and(|l| l.expires_at > now) {
            return Ok(None);
        }
        let lease = Lease {
            name: name.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            expires_at: now + to_delta(ttl),
        };
        state.locks.insert(name.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, lease: &Lease) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.locks.get(&lease.name).is_some_and(|l| l.token == lease.token) {
            state.locks.remove(&lease.name);
            return Ok(true);
        }
        Ok(false)
    }
}

impl Driver for MemoryDriver {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    fn kind(&self) -> &'static str {
        "memory"
    }

    fn lock(&self) -> Arc<dyn DistributedLock> {
        Arc::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::NewJob;
    use claims::{assert_none, assert_ok, assert_some};
    use serde_json::json;

    fn driver() -> (MemoryDriver, ManualClock) {
        let clock = ManualClock::default();
        let driver = MemoryDriver::new("memory")
            .retry_after(Duration::from_secs(30))
            .with_clock(Arc::new(clock.clone()));
        (driver, clock)
    }

    fn job(clock: &ManualClock, new: NewJob) -> Job {
        new.into_job(clock.now(), "default", 3)
    }

    #[tokio::test]
    async fn reserves_by_priority() {
        let (driver, clock) = driver();
        for priority in [1, 5, 3] {
            let new = NewJob::new("test", json!({ "priority": priority })).priority(priority);
            driver.enqueue(job(&clock, new)).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(job) = driver.reserve("default").await.unwrap() {
            order.push(job.priority);
        }
        assert_eq!(order, vec![5, 3, 1]);
    }

    #[tokio::test]
    async fn equal_priority_reserves_in_creation_order() {
        let (driver, clock) = driver();
        let first = driver.enqueue(job(&clock, NewJob::new("a", json!(1)))).await.unwrap();
        let second = driver.enqueue(job(&clock, NewJob::new("b", json!(2)))).await.unwrap();

        assert_eq!(assert_some!(driver.reserve("default").await.unwrap()).id, first);
        assert_eq!(assert_some!(driver.reserve("default").await.unwrap()).id, second);
    }

    #[tokio::test]
    async fn delayed_jobs_wait() {
        let (driver, clock) = driver();
        let new = NewJob::new("test", json!(null)).delay(Duration::from_secs(60));
        driver.enqueue(job(&clock, new)).await.unwrap();

        assert_none!(driver.reserve("default").await.unwrap());
        clock.advance(Duration::from_secs(59));
        assert_none!(driver.reserve("default").await.unwrap());
        clock.advance(Duration::from_secs(1));
        assert_some!(driver.reserve("default").await.unwrap());
    }

    #[tokio::test]
    async fn expired_reservations_are_recovered() {
        let (driver, clock) = driver();
        let id = driver.enqueue(job(&clock, NewJob::new("test", json!(null)))).await.unwrap();

        let first = assert_some!(driver.reserve("default").await.unwrap());
        assert_eq!(first.attempts, 1);
        assert_none!(driver.reserve("default").await.unwrap());

        clock.advance(Duration::from_secs(31));
        let second = assert_some!(driver.reserve("default").await.unwrap());
        assert_eq!(second.id, id);
        assert_eq!(second.attempts, 2);

        assert!(assert_ok!(driver.acknowledge(&id).await));
        assert!(!assert_ok!(driver.acknowledge(&id).await));
        assert_eq!(driver.stats("default").await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn lapsed_reservations_cannot_be_settled() {
        let (driver, clock) = driver();
        let new = NewJob::new("test", json!(null)).max_attempts(5);
        driver.enqueue(job(&clock, new)).await.unwrap();

        let stale = assert_some!(driver.reserve("default").await.unwrap());
        clock.advance(Duration::from_secs(31));
        let current = assert_some!(driver.reserve("default").await.unwrap());

        assert_none!(JobStore::release(&driver, &stale, Duration::ZERO, "late").await.unwrap());
        assert!(!driver.fail(&stale, "late").await.unwrap());
        assert_eq!(driver.stats("default").await.unwrap().reserved, 1);
        assert!(driver.failed_jobs(&FailedJobQuery::default()).await.unwrap().is_empty());

        let released = JobStore::release(&driver, &current, Duration::ZERO, "boom").await.unwrap();
        assert!(matches!(released, Some(Released::Requeued(_))));
    }

    #[tokio::test]
    async fn release_fails_after_last_attempt() {
        let (driver, clock) = driver();
        let new = NewJob::new("test", json!(null)).max_attempts(2);
        let id = driver.enqueue(job(&clock, new)).await.unwrap();

        let reserved = assert_some!(driver.reserve("default").await.unwrap());
        assert_eq!(reserved.id, id);
        let released = JobStore::release(&driver, &reserved, Duration::ZERO, "boom").await.unwrap();
        assert!(matches!(released, Some(Released::Requeued(_))));

        let reserved = assert_some!(driver.reserve("default").await.unwrap());
        let released = JobStore::release(&driver, &reserved, Duration::ZERO, "boom again").await.unwrap();
        assert_eq!(released, Some(Released::Failed));

        assert_none!(driver.reserve("default").await.unwrap());
        let failed = driver.failed_jobs(&FailedJobQuery::default()).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error, "boom again");
        assert_eq!(failed[0].connection, "memory");
    }

    #[tokio::test]
    async fn concurrent_reservers_get_one_job_once() {
        let (driver, clock) = driver();
        driver.enqueue(job(&clock, NewJob::new("test", json!(null)))).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let driver = driver.clone();
                tokio::spawn(async move { driver.reserve("default").await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn retried_failed_jobs_jump_the_queue() {
        let (driver, clock) = driver();
        let failing = job(&clock, NewJob::new("test", json!("old")));
        driver.enqueue(failing.clone()).await.unwrap();
        let reserved = assert_some!(driver.reserve("default").await.unwrap());
        assert!(driver.fail(&reserved, "nope").await.unwrap());

        clock.advance(Duration::from_secs(5));
        driver.enqueue(job(&clock, NewJob::new("test", json!("new")))).await.unwrap();

        let failed = driver.failed_jobs(&FailedJobQuery::default()).await.unwrap();
        let retried = assert_some!(driver.retry_failed(&failed[0].id).await.unwrap());
        assert_eq!(retried, failing.id);

        let next = assert_some!(driver.reserve("default").await.unwrap());
        assert_eq!(next.id, failing.id);
        assert_eq!(next.attempts, 1);
        assert!(driver.failed_jobs(&FailedJobQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prune_drops_old_failures_only() {
        let (driver, clock) = driver();
        for error in ["old", "recent"] {
            driver.enqueue(job(&clock, NewJob::new("test", json!(null)))).await.unwrap();
            let reserved = assert_some!(driver.reserve("default").await.unwrap());
            assert!(driver.fail(&reserved, error).await.unwrap());
            clock.advance(Duration::from_secs(3600));
        }
        let cutoff = clock.now() - to_delta(Duration::from_secs(3600));

        assert_eq!(driver.prune_failed(cutoff).await.unwrap(), 1);
        let remaining = driver.failed_jobs(&FailedJobQuery::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].error, "recent");
    }

    #[tokio::test]
    async fn batch_completion_flag_is_set_once() {
        let (driver, clock) = driver();
        let batch = driver.create_batch(Batch::new(None, None, clock.now())).await.unwrap();
        driver.add_batch_jobs(&batch.id, 2).await.unwrap();

        let first = driver.record_batch_outcome(&batch.id, true).await.unwrap();
        assert!(!first.just_finished);
        let second = driver.record_batch_outcome(&batch.id, false).await.unwrap();
        assert!(second.just_finished);
        assert_eq!(second.batch.failed_jobs, 1);

        let duplicate = driver.record_batch_outcome(&batch.id, true).await.unwrap();
        assert!(!duplicate.just_finished);
        assert_eq!(duplicate.batch.completed_jobs, 1);

        assert!(matches!(
            driver.add_batch_jobs(&batch.id, 1).await,
            Err(StoreError::BatchFinished(_))
        ));
    }

    #[tokio::test]
    async fn locks_are_exclusive_until_released_or_expired() {
        let (driver, clock) = driver();
        let lease = assert_some!(driver.acquire("tick", Duration::from_secs(10)).await.unwrap());
        assert_none!(driver.acquire("tick", Duration::from_secs(10)).await.unwrap());

        assert!(DistributedLock::release(&driver, &lease).await.unwrap());
        let lease = assert_some!(driver.acquire("tick", Duration::from_secs(10)).await.unwrap());

        clock.advance(Duration::from_secs(11));
        assert_some!(driver.acquire("tick", Duration::from_secs(10)).await.unwrap());
        assert!(!DistributedLock::release(&driver, &lease).await.unwrap());
    }

    #[tokio::test]
    async fn stats_split_pending_reserved_delayed() {
        let (driver, clock) = driver();
        for _ in 0..3 {
            driver.enqueue(job(&clock, NewJob::new("test", json!(null)))).await.unwrap();
        }
        let delayed = NewJob::new("test", json!(null)).delay(Duration::from_secs(60));
        driver.enqueue(job(&clock, delayed)).await.unwrap();
        assert_some!(driver.reserve("default").await.unwrap());

        clock.advance(Duration::from_secs(10));
        let stats = driver.stats("default").await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.reserved, 1);
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.total, 4);
        assert!((stats.avg_wait_secs - 10.0).abs() < 0.001);
        assert_eq!(driver.queues().await.unwrap(), vec!["default".to_string()]);
    }
}
