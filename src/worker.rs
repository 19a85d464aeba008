use crate::batch::BatchTracker;
use crate::hooks::WorkerHooks;
use crate::job::{Job, JobError, backoff_delay};
use crate::job_registry::JobRegistry;
use crate::store::{Driver, Released};
use crate::util::{resident_memory_mb, try_to_extract_panic_info, with_sentry_transaction};
use futures_util::FutureExt;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

const DEFAULT_SLEEP: Duration = Duration::from_secs(3);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Where a worker is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting for the next poll.
    Idle,
    /// Asking the store for a job.
    Reserving,
    /// Running a handler.
    Executing,
    /// Deleting a successful job.
    Acking,
    /// Putting a failed job back.
    Releasing,
    /// Moving a job to the failed-job store.
    Failing,
    /// Finishing up; no new reservations.
    Draining,
    /// Done.
    Stopped,
}

/// Why a worker left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown was requested.
    Shutdown,
    /// The queue was empty and the worker was told to stop then.
    QueueEmpty,
    /// A self-imposed limit was reached.
    Retired(RetireReason),
}

/// Self-imposed limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// Processed `max_jobs` jobs.
    MaxJobs,
    /// Ran for `max_time`.
    MaxTime,
    /// Resident memory reached `memory_limit`.
    MemoryLimit,
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MaxJobs => "processed the maximum number of jobs",
            Self::MaxTime => "reached the maximum run time",
            Self::MemoryLimit => "exceeded the memory limit",
        })
    }
}

/// Tuning for a single worker loop.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    /// Pause after an empty poll.
    pub sleep: Duration,
    /// Random extra pause, up to this much, to spread out polls.
    pub jitter: Duration,
    /// Longest a handler may run before it is abandoned and the job released.
    pub timeout: Duration,
    /// Retire after this many jobs.
    pub max_jobs: Option<u64>,
    /// Retire after running this long.
    pub max_time: Option<Duration>,
    /// Retire once resident memory reaches this many megabytes.
    pub memory_limit_mb: Option<u64>,
    /// Upper bound on attempts, applied on top of each job's own limit.
    pub max_attempts: Option<i32>,
    /// First retry delay.
    pub backoff_base: Duration,
    /// Longest retry delay.
    pub backoff_max: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            sleep: DEFAULT_SLEEP,
            jitter: DEFAULT_JITTER,
            timeout: DEFAULT_TIMEOUT,
            max_jobs: None,
            max_time: None,
            memory_limit_mb: None,
            max_attempts: None,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl WorkerOptions {
    /// Set how long to sleep after an empty poll.
    pub fn sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the handler timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retire after `max_jobs` jobs.
    pub fn max_jobs(mut self, max_jobs: u64) -> Self {
        self.max_jobs = Some(max_jobs);
        self
    }

    /// Retire after `max_time`.
    pub fn max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    /// Retire once resident memory reaches `megabytes`.
    pub fn memory_limit_mb(mut self, megabytes: u64) -> Self {
        self.memory_limit_mb = Some(megabytes);
        self
    }

    /// Cap attempts for every job this worker runs.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the retry backoff.
    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }
}

/// The job a worker is running right now.
#[derive(Debug, Clone)]
pub struct CurrentJob {
    /// Job id.
    pub id: String,
    /// When the handler started.
    pub started: Instant,
}

/// Live view of a worker, published after every state change.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    /// Current state.
    pub state: WorkerState,
    /// Jobs run to a terminal or released outcome.
    pub jobs_processed: u64,
    /// The job being executed.
    pub current_job: Option<CurrentJob>,
    /// Time spent in finished handlers.
    pub busy: Duration,
    /// When the worker started.
    pub started: Instant,
}

impl WorkerStatus {
    pub(crate) fn new() -> Self {
        Self {
            state: WorkerState::Idle,
            jobs_processed: 0,
            current_job: None,
            busy: Duration::ZERO,
            started: Instant::now(),
        }
    }

    /// How long the current job has been running.
    pub fn current_job_elapsed(&self) -> Option<Duration> {
        self.current_job.as_ref().map(|job| job.started.elapsed())
    }

    /// Share of the worker's lifetime spent executing handlers, in `0..=1`.
    pub fn utilization(&self) -> f64 {
        let lifetime = self.started.elapsed().as_secs_f64();
        if lifetime <= 0.0 {
            return 0.0;
        }
        let busy = self.busy + self.current_job_elapsed().unwrap_or_default();
        (busy.as_secs_f64() / lifetime).clamp(0.0, 1.0)
    }
}

pub(crate) struct Worker<Context> {
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) queue: String,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) hooks: Arc<dyn WorkerHooks>,
    pub(crate) batches: BatchTracker,
    pub(crate) options: WorkerOptions,
    pub(crate) shutdown: CancellationToken,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) status: watch::Sender<WorkerStatus>,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.options.jitter.is_zero() {
            return self.options.sleep;
        }

        let jitter_millis = u64::try_from(self.options.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.options.sleep + Duration::from_millis(random_jitter)
    }

    /// Sleep between polls, waking early on shutdown.
    async fn pause(&self) {
        let sleep_duration = self.sleep_duration_with_jitter();
        trace!("No pending jobs found. Polling again in {sleep_duration:?}…");
        tokio::select! {
            () = sleep(sleep_duration) => {}
            () = self.shutdown.cancelled() => {}
        }
    }

    /// Once shutdown is requested every state short of `Stopped` reads as
    /// `Draining`.
    fn visible_state(&self, state: WorkerState) -> WorkerState {
        if self.shutdown.is_cancelled() && state != WorkerState::Stopped {
            WorkerState::Draining
        } else {
            state
        }
    }

    fn set_state(&self, state: WorkerState) {
        let state = self.visible_state(state);
        self.status.send_modify(|status| status.state = state);
    }

    fn retirement_reason(&self) -> Option<RetireReason> {
        let status = self.status.borrow();
        if self
            .options
            .max_jobs
            .is_some_and(|max| status.jobs_processed >= max)
        {
            return Some(RetireReason::MaxJobs);
        }
        if self
            .options
            .max_time
            .is_some_and(|max| status.started.elapsed() >= max)
        {
            return Some(RetireReason::MaxTime);
        }
        if let Some(limit) = self.options.memory_limit_mb {
            if resident_memory_mb().is_some_and(|used| used >= limit) {
                return Some(RetireReason::MemoryLimit);
            }
        }
        None
    }

    /// Attempts allowed for `job` on this worker.
    fn max_attempts_for(&self, job: &Job) -> i32 {
        match self.options.max_attempts {
            Some(ceiling) => job.max_attempts.min(ceiling.max(1)),
            None => job.max_attempts,
        }
    }

    /// Run jobs until shutdown, retirement, or (if configured) an empty queue.
    pub(crate) async fn run(&self) -> WorkerExit {
        let exit = loop {
            if self.shutdown.is_cancelled() {
                debug!("Shutdown requested. Stopping the worker…");
                break WorkerExit::Shutdown;
            }

            if let Some(reason) = self.retirement_reason() {
                info!(%reason, "Worker retiring");
                break WorkerExit::Retired(reason);
            }

            let next_job = self.run_next_job();
            tokio::pin!(next_job);
            let result = tokio::select! {
                result = &mut next_job => result,
                () = self.shutdown.cancelled() => {
                    debug!("Shutdown requested. Finishing the current job…");
                    self.set_state(WorkerState::Draining);
                    next_job.await
                }
            };

            match result {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No pending jobs found. Shutting down the worker…");
                    break WorkerExit::QueueEmpty;
                }
                Ok(None) => self.pause().await,
                Err(error) => {
                    error!("Failed to run job: {error:#}");
                    self.set_state(WorkerState::Idle);
                    self.pause().await;
                }
            }
        };

        self.set_state(WorkerState::Stopped);
        exit
    }

    /// Run the next job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if no jobs were waiting
    /// - `Err(...)` if the store could not be reached
    pub(crate) async fn run_next_job(&self) -> anyhow::Result<Option<String>> {
        self.set_state(WorkerState::Reserving);
        trace!("Looking for next job…");

        let Some(job) = self.driver.reserve(&self.queue).await? else {
            self.set_state(WorkerState::Idle);
            return Ok(None);
        };

        let span = info_span!(
            "job",
            job.id = %job.id,
            job.handler = %job.handler,
            job.attempt = job.attempts
        );

        async {
            let max_attempts = self.max_attempts_for(&job);
            let outcome = if job.attempts > max_attempts {
                // The previous attempt never reported back, most likely because
                // the worker running it died.
                Err(JobError::terminal(format!(
                    "job exceeded its maximum of {max_attempts} attempts"
                )))
            } else {
                self.execute(&job).await
            };

            self.settle(&job, outcome, max_attempts).await
        }
        .instrument(span)
        .await?;

        self.set_state(WorkerState::Idle);
        Ok(Some(job.id))
    }

    async fn execute(&self, job: &Job) -> Result<(), JobError> {
        let state = self.visible_state(WorkerState::Executing);
        self.status.send_modify(|status| {
            status.state = state;
            status.current_job = Some(CurrentJob {
                id: job.id.clone(),
                started: Instant::now(),
            });
        });
        debug!("Running job…");

        let context = self.context.clone();
        let job_registry = self.job_registry.clone();
        let handler = job.handler.clone();
        let payload = job.payload.clone();
        let timeout = self.options.timeout;

        let result = with_sentry_transaction(&job.handler, || async move {
            let run_task_fn = job_registry
                .get(&handler)
                .ok_or_else(|| JobError::terminal(format!("unknown handler `{handler}`")))?;

            let future = AssertUnwindSafe(run_task_fn(context, payload)).catch_unwind();
            match tokio::time::timeout(timeout, future).await {
                Err(_) => Err(JobError::retryable(format!(
                    "job timed out after {timeout:?}"
                ))),
                Ok(Err(panic)) => Err(JobError::Retryable(try_to_extract_panic_info(&*panic))),
                Ok(Ok(result)) => result,
            }
        })
        .bind_hub(Hub::current())
        .await;

        self.status.send_modify(|status| {
            if let Some(current) = status.current_job.take() {
                status.busy += current.started.elapsed();
            }
            status.jobs_processed += 1;
        });

        result
    }

    /// Report the outcome to the store, the hooks and the batch tracker.
    ///
    /// Hooks and batch counters only see outcomes the store accepted, so a
    /// job that ran twice after its reservation lapsed is counted once.
    async fn settle(
        &self,
        job: &Job,
        outcome: Result<(), JobError>,
        max_attempts: i32,
    ) -> anyhow::Result<()> {
        match outcome {
            Ok(()) => {
                self.set_state(WorkerState::Acking);
                debug!("Deleting successful job…");
                if !self.driver.acknowledge(&job.id).await? {
                    debug!("Job was already settled elsewhere");
                    return Ok(());
                }
                self.hooks.job_acknowledged(job);
                self.record_batch_outcome(job, true).await;
            }
            Err(error) if error.is_retryable() && job.attempts < max_attempts => {
                self.set_state(WorkerState::Releasing);
                let message = error.to_string();
                let delay = backoff_delay(
                    job.attempts,
                    self.options.backoff_base,
                    self.options.backoff_max,
                );
                warn!(retry_in = ?delay, "Failed to run job: {message}");

                match self.driver.release(job, delay, &message).await? {
                    Some(Released::Requeued(_)) => self.hooks.job_released(job, &message, delay),
                    Some(Released::Failed) => {
                        self.hooks.job_failed(job, &message);
                        self.record_batch_outcome(job, false).await;
                    }
                    None => warn!("Reservation lapsed before the job could be released"),
                }
            }
            Err(error) => {
                self.set_state(WorkerState::Failing);
                let message = error.to_string();
                warn!("Job failed permanently: {message}");
                if !self.driver.fail(job, &message).await? {
                    warn!("Reservation lapsed before the job could be failed");
                    return Ok(());
                }
                self.hooks.job_failed(job, &message);
                self.record_batch_outcome(job, false).await;
            }
        }
        Ok(())
    }

    async fn record_batch_outcome(&self, job: &Job, success: bool) {
        let Some(batch_id) = &job.batch_id else {
            return;
        };

        match self.batches.record_outcome(batch_id, success).await {
            Ok(Some(batch)) => self.hooks.batch_completed(&batch),
            Ok(None) => {}
            Err(error) => warn!(batch.id = %batch_id, "Failed to record batch outcome: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::hooks::NoopHooks;
    use crate::job::NewJob;
    use crate::store::{BatchStore, FailedJobQuery, FailedJobStore, JobStore, MemoryDriver};
    use chrono::Utc;
    use claims::{assert_matches, assert_none, assert_ok, assert_some};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Calls(Arc<AtomicUsize>);

    impl Calls {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }

        fn bump(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry() -> JobRegistry<Calls> {
        let mut registry = JobRegistry::default();
        registry.register_fn("ok", |calls: Calls, _| async move {
            calls.bump();
            Ok(())
        });
        registry.register_fn("flaky", |calls: Calls, _| async move {
            calls.bump();
            Err(JobError::from(anyhow::anyhow!("try again")))
        });
        registry.register_fn("broken", |calls: Calls, _| async move {
            calls.bump();
            Err(JobError::terminal("bad input"))
        });
        registry.register_fn("panics", |calls: Calls, _| async move {
            calls.bump();
            if calls.count() > 0 {
                panic!("oh no");
            }
            Ok(())
        });
        registry.register_fn("slow", |calls: Calls, _| async move {
            calls.bump();
            sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        registry
    }

    fn worker(driver: &MemoryDriver, calls: &Calls, options: WorkerOptions) -> Worker<Calls> {
        let driver: Arc<dyn Driver> = Arc::new(driver.clone());
        Worker {
            batches: BatchTracker::new(driver.clone(), "default".into(), 3, crate::clock::system()),
            driver,
            queue: "default".into(),
            context: calls.clone(),
            job_registry: Arc::new(registry()),
            hooks: Arc::new(NoopHooks),
            options: options.backoff(Duration::ZERO, Duration::ZERO),
            shutdown: CancellationToken::new(),
            shutdown_when_queue_empty: true,
            status: watch::channel(WorkerStatus::new()).0,
        }
    }

    async fn push(driver: &MemoryDriver, handler: &str, max_attempts: i32) -> String {
        push_at(driver, handler, max_attempts, Utc::now()).await
    }

    async fn push_at(
        driver: &MemoryDriver,
        handler: &str,
        max_attempts: i32,
        now: chrono::DateTime<Utc>,
    ) -> String {
        let job = NewJob::new(handler, json!({})).into_job(now, "default", max_attempts);
        driver.enqueue(job).await.unwrap()
    }

    async fn failed(driver: &MemoryDriver) -> Vec<String> {
        let failed = driver.failed_jobs(&FailedJobQuery::default()).await.unwrap();
        failed.into_iter().map(|f| f.error).collect()
    }

    #[tokio::test]
    async fn successful_jobs_are_deleted() {
        let driver = MemoryDriver::new("memory");
        let calls = Calls::default();
        push(&driver, "ok", 3).await;

        let exit = worker(&driver, &calls, WorkerOptions::default()).run().await;
        assert_eq!(exit, WorkerExit::QueueEmpty);
        assert_eq!(calls.count(), 1);
        assert_eq!(assert_ok!(driver.stats("default").await).total, 0);
    }

    #[tokio::test]
    async fn always_failing_jobs_run_exactly_max_attempts_times() {
        let driver = MemoryDriver::new("memory");
        let calls = Calls::default();
        push(&driver, "flaky", 3).await;

        worker(&driver, &calls, WorkerOptions::default()).run().await;
        assert_eq!(calls.count(), 3);
        assert_eq!(failed(&driver).await, vec!["try again"]);
    }

    #[tokio::test]
    async fn worker_ceiling_caps_attempts() {
        let driver = MemoryDriver::new("memory");
        let calls = Calls::default();
        push(&driver, "flaky", 5).await;

        let options = WorkerOptions::default().max_attempts(2);
        worker(&driver, &calls, options).run().await;
        assert_eq!(calls.count(), 2);
    }

    #[tokio::test]
    async fn terminal_errors_skip_remaining_attempts() {
        let driver = MemoryDriver::new("memory");
        let calls = Calls::default();
        push(&driver, "broken", 5).await;

        worker(&driver, &calls, WorkerOptions::default()).run().await;
        assert_eq!(calls.count(), 1);
        assert_eq!(failed(&driver).await, vec!["bad input"]);
    }

    #[tokio::test]
    async fn unknown_handlers_fail_terminally() {
        let driver = MemoryDriver::new("memory");
        let calls = Calls::default();
        push(&driver, "missing", 5).await;

        worker(&driver, &calls, WorkerOptions::default()).run().await;
        assert_eq!(failed(&driver).await, vec!["unknown handler `missing`"]);
    }

    #[tokio::test]
    async fn panics_are_retried() {
        let driver = MemoryDriver::new("memory");
        let calls = Calls::default();
        push(&driver, "panics", 2).await;

        worker(&driver, &calls, WorkerOptions::default()).run().await;
        assert_eq!(calls.count(), 2);
        assert_eq!(failed(&driver).await, vec!["job panicked: oh no"]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_jobs_time_out_and_are_released() {
        let driver = MemoryDriver::new("memory");
        let calls = Calls::default();
        let id = push(&driver, "slow", 3).await;

        let options = WorkerOptions::default().timeout(Duration::from_secs(1));
        let worker = worker(&driver, &calls, options);
        assert_eq!(assert_ok!(worker.run_next_job().await), Some(id));

        let job = assert_some!(assert_ok!(driver.reserve("default").await));
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn crashed_last_attempt_fails_without_running() {
        let clock = ManualClock::new(Utc::now());
        let driver = MemoryDriver::new("memory")
            .retry_after(Duration::from_secs(10))
            .with_clock(Arc::new(clock.clone()));
        let calls = Calls::default();
        push_at(&driver, "ok", 1, clock.now()).await;

        // A worker reserved the only attempt and died.
        assert_some!(assert_ok!(driver.reserve("default").await));
        clock.advance(Duration::from_secs(11));

        worker(&driver, &calls, WorkerOptions::default()).run().await;
        assert_eq!(calls.count(), 0);
        assert_eq!(
            failed(&driver).await,
            vec!["job exceeded its maximum of 1 attempts"]
        );
    }

    #[tokio::test]
    async fn workers_retire_after_max_jobs() {
        let driver = MemoryDriver::new("memory");
        let calls = Calls::default();
        for _ in 0..5 {
            push(&driver, "ok", 1).await;
        }

        let worker = worker(&driver, &calls, WorkerOptions::default().max_jobs(2));
        let exit = worker.run().await;
        assert_eq!(exit, WorkerExit::Retired(RetireReason::MaxJobs));
        assert_eq!(calls.count(), 2);
        assert_eq!(worker.status.borrow().state, WorkerState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_idle_sleep() {
        let driver = MemoryDriver::new("memory");
        let calls = Calls::default();
        let mut worker = worker(&driver, &calls, WorkerOptions::default());
        worker.shutdown_when_queue_empty = false;
        worker.options.sleep = Duration::from_secs(3600);

        let token = worker.shutdown.clone();
        let handle = tokio::spawn(async move { worker.run().await });
        tokio::task::yield_now().await;
        token.cancel();

        let exit = assert_ok!(handle.await);
        assert_matches!(exit, WorkerExit::Shutdown);
        assert_none!(assert_ok!(driver.reserve("default").await));
    }

    #[tokio::test]
    async fn stale_completions_are_not_counted_twice() {
        let clock = ManualClock::new(Utc::now());
        let driver = MemoryDriver::new("memory")
            .retry_after(Duration::from_secs(10))
            .with_clock(Arc::new(clock.clone()));
        let calls = Calls::default();

        let first = worker(&driver, &calls, WorkerOptions::default());
        let batch = assert_ok!(first.batches.create_batch(None, None).await);
        assert_ok!(driver.add_batch_jobs(&batch.id, 2).await);
        for (handler, priority) in [("ok", 10), ("ok", 0)] {
            let mut job = NewJob::new(handler, json!({}))
                .priority(priority)
                .into_job(clock.now(), "default", 3);
            job.batch_id = Some(batch.id.clone());
            assert_ok!(driver.enqueue(job).await);
        }

        // The first worker stalls on A until its reservation lapses.
        let stale = assert_some!(assert_ok!(driver.reserve("default").await));
        clock.advance(Duration::from_secs(11));

        let second = worker(&driver, &calls, WorkerOptions::default());
        assert_eq!(assert_ok!(second.run_next_job().await), Some(stale.id.clone()));
        assert_ok!(first.settle(&stale, Ok(()), 3).await);

        let stored = assert_some!(assert_ok!(driver.find_batch(&batch.id).await));
        assert_eq!(stored.completed_jobs, 1);
        assert!(!stored.is_finished());
        assert_eq!(assert_ok!(driver.stats("default").await).pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_reports_draining_until_the_job_finishes() {
        let driver = MemoryDriver::new("memory");
        let calls = Calls::default();
        push(&driver, "slow", 3).await;

        let mut worker = worker(&driver, &calls, WorkerOptions::default());
        worker.shutdown_when_queue_empty = false;
        let token = worker.shutdown.clone();
        let mut status = worker.status.subscribe();
        let handle = tokio::spawn(async move { worker.run().await });

        assert_ok!(status.wait_for(|s| s.state == WorkerState::Executing).await);
        token.cancel();
        assert_ok!(status.wait_for(|s| s.state == WorkerState::Draining).await);
        assert!(status.borrow().current_job.is_some());

        assert_eq!(assert_ok!(handle.await), WorkerExit::Shutdown);
        assert_eq!(status.borrow().state, WorkerState::Stopped);
        assert_eq!(calls.count(), 1);
        assert_eq!(assert_ok!(driver.stats("default").await).total, 0);
    }

    #[test]
    fn utilization_is_bounded() {
        let mut status = WorkerStatus::new();
        status.started = Instant::now().checked_sub(Duration::from_secs(10)).unwrap();
        status.busy = Duration::from_secs(3600);
        assert!((status.utilization() - 1.0).abs() < f64::EPSILON);
    }
}
