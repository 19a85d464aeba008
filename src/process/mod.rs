//! Supervision of worker OS processes.
//!
//! The [`ProcessManager`] owns every worker process it starts. Each process is
//! watched by its own task, which forwards heartbeats into the shared pool
//! state and reports the exit. Exits are handled by whoever drives
//! [`ProcessManager::run`] (or [`ProcessManager::handle_next_exit`] in tests),
//! which replaces crashed and retired workers unless the restart ceiling of
//! the queue tripped.

pub mod heartbeat;
pub mod launcher;
#[cfg(test)]
pub(crate) mod testing;

pub use self::heartbeat::Heartbeat;
pub use self::launcher::{CommandLauncher, LaunchSpec, Launcher, ProcessEvent, WorkerProcess};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, MissedTickBehavior, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

const KILL_WAIT: Duration = Duration::from_secs(5);

/// Limits handed to each worker process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOptions {
    /// Connection the worker polls, the default one when `None`.
    pub connection: Option<String>,
    /// Resident memory ceiling in megabytes.
    pub memory_limit_mb: Option<u64>,
    /// Handler timeout.
    pub timeout: Duration,
    /// Retire after this many jobs.
    pub max_jobs: Option<u64>,
    /// Retire after running this long.
    pub max_time: Option<Duration>,
    /// Attempt ceiling applied on top of each job's own limit.
    pub max_attempts: Option<i32>,
    /// Pause after an empty poll.
    pub sleep: Duration,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            connection: None,
            memory_limit_mb: None,
            timeout: Duration::from_secs(60),
            max_jobs: None,
            max_time: None,
            max_attempts: None,
            sleep: Duration::from_secs(3),
        }
    }
}

/// Supervision thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorOptions {
    /// A worker that has not reported for this long is killed.
    pub heartbeat_grace: Duration,
    /// Extra time a job may run past the handler timeout before its worker
    /// is killed.
    pub timeout_grace: Duration,
    /// Unplanned restarts tolerated per queue within `restart_window`.
    pub restart_limit: usize,
    /// Window for `restart_limit`.
    pub restart_window: Duration,
    /// Launch attempts per worker.
    pub spawn_attempts: u32,
    /// Delay before the second launch attempt, doubled for each further one.
    pub spawn_backoff: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            heartbeat_grace: Duration::from_secs(30),
            timeout_grace: Duration::from_secs(30),
            restart_limit: 5,
            restart_window: Duration::from_secs(60),
            spawn_attempts: 3,
            spawn_backoff: Duration::from_millis(500),
        }
    }
}

/// Lifecycle of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Launched, no heartbeat yet.
    Starting,
    /// Reporting heartbeats.
    Running,
    /// Told to finish its current job and exit.
    Draining,
    /// Exited.
    Stopped,
}

/// Everything the supervisor knows about one worker process.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    /// Supervisor-assigned id.
    pub id: String,
    /// OS process id.
    pub pid: Option<u32>,
    /// Queue the worker consumes.
    pub queue: String,
    /// Limits the worker was started with.
    pub options: ProcessOptions,
    /// Lifecycle state.
    pub status: ProcessStatus,
    /// Wall-clock launch time.
    pub started_at: DateTime<Utc>,
    /// Monotonic launch time.
    pub started: Instant,
    /// When the last heartbeat arrived.
    pub last_heartbeat: Option<Instant>,
    /// Jobs processed, as last reported.
    pub jobs_processed: u64,
    /// Resident memory in megabytes, as last reported.
    pub memory_mb: Option<u64>,
    /// Share of time spent in handlers, as last reported.
    pub utilization: f64,
    /// Runtime of the current job, as last reported.
    pub current_job_elapsed: Option<Duration>,
}

/// Identifies a launched worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    /// Supervisor-assigned id.
    pub id: String,
    /// OS process id.
    pub pid: Option<u32>,
    /// Queue the worker consumes.
    pub queue: String,
}

/// Pool metrics for one queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    /// Queue name.
    pub queue: String,
    /// Workers that are starting or running.
    pub live: usize,
    /// Desired worker count.
    pub target: usize,
    /// Mean utilization of live workers, in `0..=1`.
    pub avg_utilization: f64,
    /// Jobs processed by every worker this pool ever ran.
    pub jobs_processed: u64,
    /// Whether automatic restarts are suspended.
    pub halted: bool,
}

/// Raised when a queue's workers keep dying.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    /// Affected queue.
    pub queue: String,
    /// Restarts counted within the window.
    pub restarts: usize,
    /// When the alert was raised.
    pub raised_at: DateTime<Utc>,
    /// Human readable description.
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HealthIssue {
    Unresponsive,
    MemoryExceeded,
    JobTimedOut,
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unresponsive => "missed its heartbeat",
            Self::MemoryExceeded => "exceeded its memory limit",
            Self::JobTimedOut => "ran a job past its timeout",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Drained,
    Killed(HealthIssue),
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Drain,
    Kill,
}

#[derive(Debug)]
struct ExitNotice {
    queue: String,
    worker_id: String,
    code: Option<i32>,
}

struct Slot {
    record: WorkerRecord,
    seq: u64,
    stop: Option<StopReason>,
    control: mpsc::UnboundedSender<Control>,
}

impl Slot {
    fn is_live(&self) -> bool {
        self.stop.is_none()
    }

    fn send(&mut self, control: Control) {
        // The watch task is gone once the process exited; nothing to do then.
        let _ = self.control.send(control);
    }
}

struct Pool {
    target: usize,
    options: ProcessOptions,
    workers: BTreeMap<String, Slot>,
    restarts: VecDeque<Instant>,
    halted: bool,
    exited_jobs: u64,
}

impl Pool {
    fn new(options: ProcessOptions) -> Self {
        Self {
            target: 0,
            options,
            workers: BTreeMap::new(),
            restarts: VecDeque::new(),
            halted: false,
            exited_jobs: 0,
        }
    }

    fn live(&self) -> usize {
        self.workers.values().filter(|slot| slot.is_live()).count()
    }

    fn missing(&self) -> usize {
        if self.halted {
            return 0;
        }
        self.target.saturating_sub(self.live())
    }
}

#[derive(Default)]
struct State {
    pools: BTreeMap<String, Pool>,
    alerts: Vec<Alert>,
}

struct Inner {
    launcher: Arc<dyn Launcher>,
    options: SupervisorOptions,
    state: Mutex<State>,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
    exits: Mutex<mpsc::UnboundedReceiver<ExitNotice>>,
    next_seq: AtomicU64,
}

/// Spawns, scales, health-checks and restarts pools of worker processes.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessManager")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl ProcessManager {
    /// Supervise workers started by `launcher`.
    pub fn new(launcher: impl Launcher, options: SupervisorOptions) -> Self {
        let (exit_tx, exits) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                launcher: Arc::new(launcher),
                options,
                state: Mutex::new(State::default()),
                exit_tx,
                exits: Mutex::new(exits),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Launch one worker for `queue`.
    pub async fn spawn(&self, queue: &str, options: ProcessOptions) -> io::Result<WorkerHandle> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{queue}-{seq}");
        let spec = LaunchSpec {
            worker_id: id.clone(),
            queue: queue.to_string(),
            options: options.clone(),
        };

        let process = self.inner.launcher.launch(&spec).await?;
        let pid = process.pid();
        let (control, commands) = mpsc::unbounded_channel();

        let record = WorkerRecord {
            id: id.clone(),
            pid,
            queue: queue.to_string(),
            options: options.clone(),
            status: ProcessStatus::Starting,
            started_at: Utc::now(),
            started: Instant::now(),
            last_heartbeat: None,
            jobs_processed: 0,
            memory_mb: None,
            utilization: 0.0,
            current_job_elapsed: None,
        };

        {
            let mut state = self.inner.state.lock().await;
            let pool = state
                .pools
                .entry(queue.to_string())
                .or_insert_with(|| Pool::new(options));
            pool.workers.insert(
                id.clone(),
                Slot {
                    record,
                    seq,
                    stop: None,
                    control,
                },
            );
        }

        let span = info_span!("process", worker.id = %id, queue = %queue, pid = ?pid);
        tokio::spawn(
            watch_process(
                self.inner.clone(),
                queue.to_string(),
                id.clone(),
                process,
                commands,
            )
            .instrument(span),
        );

        info!(worker.id = %id, %queue, ?pid, "Spawned worker process");
        Ok(WorkerHandle {
            id,
            pid,
            queue: queue.to_string(),
        })
    }

    /// Launch with retries. Gives up quietly after the last attempt.
    async fn spawn_with_retry(&self, queue: &str, options: &ProcessOptions) -> Option<WorkerHandle> {
        let attempts = self.inner.options.spawn_attempts.max(1);
        for attempt in 0..attempts {
            match self.spawn(queue, options.clone()).await {
                Ok(handle) => return Some(handle),
                Err(error) => {
                    warn!(%queue, attempt = attempt + 1, %error, "Failed to spawn worker process");
                }
            }
            if attempt + 1 < attempts {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                sleep(self.inner.options.spawn_backoff.saturating_mul(factor)).await;
            }
        }
        error!(%queue, attempts, "Giving up on spawning a worker process");
        None
    }

    /// Bring `queue` to `target` live workers.
    ///
    /// Surplus workers are drained, least utilized first and then oldest.
    /// Missing workers are spawned unless restarts for the queue are halted.
    /// Returns the number of live workers afterwards.
    pub async fn scale(&self, queue: &str, target: usize, options: ProcessOptions) -> usize {
        let missing = {
            let mut state = self.inner.state.lock().await;
            let pool = state
                .pools
                .entry(queue.to_string())
                .or_insert_with(|| Pool::new(options.clone()));
            pool.target = target;
            pool.options = options;

            let live = pool.live();
            if live > target {
                let mut candidates: Vec<_> = pool
                    .workers
                    .values()
                    .filter(|slot| slot.is_live())
                    .map(|slot| (slot.record.utilization, slot.record.started, slot.seq, slot.record.id.clone()))
                    .collect();
                candidates.sort_by(|a, b| {
                    a.0.total_cmp(&b.0)
                        .then(a.1.cmp(&b.1))
                        .then(a.2.cmp(&b.2))
                });

                for (_, _, _, id) in candidates.into_iter().take(live - target) {
                    if let Some(slot) = pool.workers.get_mut(&id) {
                        debug!(worker.id = %id, %queue, "Draining worker process");
                        slot.stop = Some(StopReason::Drained);
                        slot.record.status = ProcessStatus::Draining;
                        slot.send(Control::Drain);
                    }
                }
            } else if pool.halted && live < target {
                warn!(%queue, "Restarts are halted, not spawning workers");
            }
            pool.missing()
        };

        self.top_up(queue, missing).await;
        self.pool_stats(queue).await.live
    }

    async fn top_up(&self, queue: &str, missing: usize) {
        if missing == 0 {
            return;
        }
        let options = {
            let state = self.inner.state.lock().await;
            match state.pools.get(queue) {
                Some(pool) => pool.options.clone(),
                None => return,
            }
        };
        for _ in 0..missing {
            self.spawn_with_retry(queue, &options).await;
        }
    }

    /// Kill workers that stopped reporting, outgrew their memory limit or
    /// ran a job past `timeout + timeout_grace`. Returns the killed ids.
    ///
    /// Replacements are spawned when their exits are handled.
    pub async fn monitor_health(&self) -> Vec<String> {
        let now = Instant::now();
        let grace = self.inner.options.heartbeat_grace;
        let timeout_grace = self.inner.options.timeout_grace;
        let mut killed = Vec::new();

        let mut state = self.inner.state.lock().await;
        for (queue, pool) in &mut state.pools {
            for slot in pool.workers.values_mut() {
                // A draining worker finishes its job on its own schedule.
                if slot.stop.is_some() {
                    continue;
                }

                let record = &slot.record;
                let last_seen = record.last_heartbeat.unwrap_or(record.started);
                let silence = now.saturating_duration_since(last_seen);
                let job_runtime = record
                    .current_job_elapsed
                    .map(|elapsed| elapsed + silence);

                let issue = if silence > grace {
                    Some(HealthIssue::Unresponsive)
                } else if record
                    .options
                    .memory_limit_mb
                    .zip(record.memory_mb)
                    .is_some_and(|(limit, used)| used > limit)
                {
                    Some(HealthIssue::MemoryExceeded)
                } else if job_runtime.is_some_and(|runtime| runtime > record.options.timeout + timeout_grace) {
                    Some(HealthIssue::JobTimedOut)
                } else {
                    None
                };

                if let Some(issue) = issue {
                    warn!(worker.id = %record.id, %queue, pid = ?record.pid, "Killing worker process that {issue}");
                    killed.push(record.id.clone());
                    slot.stop = Some(StopReason::Killed(issue));
                    slot.send(Control::Kill);
                }
            }
        }
        killed
    }

    /// Wait for the next worker exit and react to it.
    pub async fn handle_next_exit(&self) {
        let notice = self.inner.exits.lock().await.recv().await;
        if let Some(notice) = notice {
            self.handle_exit(notice).await;
        }
    }

    async fn handle_exit(&self, notice: ExitNotice) {
        let ExitNotice {
            queue,
            worker_id,
            code,
        } = notice;

        let missing = {
            let mut state = self.inner.state.lock().await;
            let State { pools, alerts } = &mut *state;
            let Some(pool) = pools.get_mut(&queue) else {
                return;
            };
            let Some(mut slot) = pool.workers.remove(&worker_id) else {
                return;
            };
            slot.record.status = ProcessStatus::Stopped;
            pool.exited_jobs += slot.record.jobs_processed;

            let unplanned = match slot.stop {
                Some(StopReason::Drained) => {
                    debug!(worker.id = %worker_id, %queue, ?code, "Worker process drained");
                    false
                }
                Some(StopReason::Killed(issue)) => {
                    info!(worker.id = %worker_id, %queue, "Worker process that {issue} was killed");
                    true
                }
                None if code == Some(0) => {
                    info!(worker.id = %worker_id, %queue, "Worker process retired");
                    false
                }
                None => {
                    warn!(worker.id = %worker_id, %queue, ?code, "Worker process crashed");
                    true
                }
            };

            if unplanned && !pool.halted {
                let now = Instant::now();
                let window = self.inner.options.restart_window;
                pool.restarts.push_back(now);
                while pool
                    .restarts
                    .front()
                    .is_some_and(|at| now.saturating_duration_since(*at) > window)
                {
                    pool.restarts.pop_front();
                }

                let restarts = pool.restarts.len();
                if restarts > self.inner.options.restart_limit {
                    pool.halted = true;
                    let message = format!(
                        "{restarts} worker restarts within {window:?}, automatic restarts halted"
                    );
                    error!(%queue, restarts, "{message}");
                    alerts.push(Alert {
                        queue: queue.clone(),
                        restarts,
                        raised_at: Utc::now(),
                        message,
                    });
                }
            }

            pool.missing()
        };

        self.top_up(&queue, missing).await;
    }

    /// Drain every worker, wait up to `timeout` for them to exit, then kill
    /// whatever is left.
    pub async fn stop_all(&self, timeout: Duration) {
        {
            let mut state = self.inner.state.lock().await;
            for pool in state.pools.values_mut() {
                pool.target = 0;
                for slot in pool.workers.values_mut() {
                    if slot.stop.is_none() {
                        slot.stop = Some(StopReason::Drained);
                        slot.record.status = ProcessStatus::Draining;
                        slot.send(Control::Drain);
                    }
                }
            }
        }

        if self.wait_for_exits(Instant::now() + timeout).await {
            return;
        }

        {
            let mut state = self.inner.state.lock().await;
            for pool in state.pools.values_mut() {
                for slot in pool.workers.values_mut() {
                    warn!(worker.id = %slot.record.id, "Worker process did not drain in time, killing it");
                    slot.send(Control::Kill);
                }
            }
        }

        if !self.wait_for_exits(Instant::now() + KILL_WAIT).await {
            error!("Some worker processes could not be stopped");
        }
    }

    /// Handle exits until no worker is left. Returns false on timeout.
    async fn wait_for_exits(&self, deadline: Instant) -> bool {
        let mut exits = self.inner.exits.lock().await;
        loop {
            if self.worker_count().await == 0 {
                return true;
            }
            match timeout_at(deadline, exits.recv()).await {
                Ok(Some(notice)) => self.handle_exit(notice).await,
                Ok(None) | Err(_) => return false,
            }
        }
    }

    async fn worker_count(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.pools.values().map(|pool| pool.workers.len()).sum()
    }

    /// Supervise until `shutdown` fires: handle exits as they happen and run
    /// [`monitor_health`](Self::monitor_health) every `health_interval`. On
    /// shutdown every worker is stopped with [`stop_all`](Self::stop_all).
    pub async fn run(&self, health_interval: Duration, shutdown: CancellationToken, stop_timeout: Duration) {
        let mut ticker = tokio::time::interval(health_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let notice = {
                let mut exits = self.inner.exits.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => None,
                    notice = exits.recv() => notice,
                }
            };

            match notice {
                Some(notice) => self.handle_exit(notice).await,
                None => {
                    self.monitor_health().await;
                }
            }
        }

        info!("Stopping all worker processes…");
        self.stop_all(stop_timeout).await;
    }

    /// Pool metrics for `queue`. Unknown queues report an empty pool.
    pub async fn pool_stats(&self, queue: &str) -> PoolStats {
        let state = self.inner.state.lock().await;
        let Some(pool) = state.pools.get(queue) else {
            return PoolStats {
                queue: queue.to_string(),
                live: 0,
                target: 0,
                avg_utilization: 0.0,
                jobs_processed: 0,
                halted: false,
            };
        };

        let live: Vec<_> = pool.workers.values().filter(|slot| slot.is_live()).collect();
        let avg_utilization = if live.is_empty() {
            0.0
        } else {
            live.iter().map(|slot| slot.record.utilization).sum::<f64>() / live.len() as f64
        };

        PoolStats {
            queue: queue.to_string(),
            live: live.len(),
            target: pool.target,
            avg_utilization,
            jobs_processed: pool.exited_jobs
                + pool
                    .workers
                    .values()
                    .map(|slot| slot.record.jobs_processed)
                    .sum::<u64>(),
            halted: pool.halted,
        }
    }

    /// Records of every worker of `queue`, in launch order.
    pub async fn workers(&self, queue: &str) -> Vec<WorkerRecord> {
        let state = self.inner.state.lock().await;
        let Some(pool) = state.pools.get(queue) else {
            return Vec::new();
        };
        let mut slots: Vec<_> = pool.workers.values().collect();
        slots.sort_by_key(|slot| slot.seq);
        slots.into_iter().map(|slot| slot.record.clone()).collect()
    }

    /// Outstanding restart-ceiling alerts.
    pub async fn alerts(&self) -> Vec<Alert> {
        self.inner.state.lock().await.alerts.clone()
    }

    /// Clear the alert for `queue` and re-enable automatic restarts.
    ///
    /// Returns whether the queue was halted.
    pub async fn resume(&self, queue: &str) -> bool {
        let (was_halted, missing) = {
            let mut state = self.inner.state.lock().await;
            state.alerts.retain(|alert| alert.queue != queue);
            let Some(pool) = state.pools.get_mut(queue) else {
                return false;
            };
            let was_halted = pool.halted;
            pool.halted = false;
            pool.restarts.clear();
            (was_halted, pool.missing())
        };

        if was_halted {
            info!(%queue, "Resuming automatic restarts");
        }
        self.top_up(queue, missing).await;
        was_halted
    }
}

impl Inner {
    async fn record_heartbeat(&self, queue: &str, id: &str, heartbeat: Heartbeat) {
        let mut state = self.state.lock().await;
        let Some(slot) = state
            .pools
            .get_mut(queue)
            .and_then(|pool| pool.workers.get_mut(id))
        else {
            return;
        };

        let record = &mut slot.record;
        if record.status == ProcessStatus::Starting {
            record.status = ProcessStatus::Running;
        }
        record.last_heartbeat = Some(Instant::now());
        record.pid = record.pid.or(Some(heartbeat.pid));
        record.jobs_processed = heartbeat.jobs_processed;
        record.memory_mb = heartbeat.memory_mb;
        record.utilization = heartbeat.utilization.clamp(0.0, 1.0);
        record.current_job_elapsed = heartbeat.current_job_elapsed();
    }
}

async fn watch_process(
    inner: Arc<Inner>,
    queue: String,
    id: String,
    mut process: Box<dyn WorkerProcess>,
    mut commands: mpsc::UnboundedReceiver<Control>,
) {
    let code = loop {
        tokio::select! {
            Some(command) = commands.recv() => match command {
                Control::Drain => process.drain(),
                Control::Kill => process.kill(),
            },
            event = process.next_event() => match event {
                ProcessEvent::Heartbeat(heartbeat) => {
                    inner.record_heartbeat(&queue, &id, heartbeat).await;
                }
                ProcessEvent::Exited(code) => break code,
            },
        }
    };

    let notice = ExitNotice {
        queue,
        worker_id: id,
        code,
    };
    if inner.exit_tx.send(notice).is_err() {
        debug!("Process manager is gone");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::FakeLauncher;
    use claims::assert_none;

    fn manager(options: SupervisorOptions) -> (ProcessManager, FakeLauncher) {
        let launcher = FakeLauncher::default();
        (ProcessManager::new(launcher.clone(), options), launcher)
    }

    /// Let the watch tasks catch up.
    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn scale_up_then_down_drains_least_busy() {
        let (manager, launcher) = manager(SupervisorOptions::default());

        assert_eq!(manager.scale("emails", 3, ProcessOptions::default()).await, 3);
        assert_eq!(launcher.launched(), 3);

        launcher.worker(0).heartbeat(0.9, None, None);
        launcher.worker(1).heartbeat(0.1, None, None);
        launcher.worker(2).heartbeat(0.5, None, None);
        settle().await;

        let workers = manager.workers("emails").await;
        assert!(workers.iter().all(|w| w.status == ProcessStatus::Running));

        assert_eq!(manager.scale("emails", 1, ProcessOptions::default()).await, 1);
        assert!(!launcher.worker(0).drained());
        assert!(launcher.worker(1).drained());
        assert!(launcher.worker(2).drained());

        manager.handle_next_exit().await;
        manager.handle_next_exit().await;
        assert_eq!(manager.workers("emails").await.len(), 1);
        assert_eq!(launcher.launched(), 3);

        let stats = manager.pool_stats("emails").await;
        assert_eq!(stats.live, 1);
        assert_eq!(stats.target, 1);
        assert_eq!(stats.jobs_processed, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn scale_down_prefers_oldest_among_equals() {
        let (manager, launcher) = manager(SupervisorOptions::default());

        manager.scale("emails", 2, ProcessOptions::default()).await;
        manager.scale("emails", 1, ProcessOptions::default()).await;

        assert!(launcher.worker(0).drained());
        assert!(!launcher.worker(1).drained());
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_workers_are_replaced() {
        let (manager, launcher) = manager(SupervisorOptions::default());
        manager.scale("emails", 2, ProcessOptions::default()).await;

        launcher.worker(0).exit(Some(101));
        manager.handle_next_exit().await;

        assert_eq!(launcher.launched(), 3);
        assert_eq!(manager.pool_stats("emails").await.live, 2);
        assert!(manager.alerts().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retirement_does_not_count_as_a_crash() {
        let options = SupervisorOptions {
            restart_limit: 1,
            ..SupervisorOptions::default()
        };
        let (manager, launcher) = manager(options);
        manager.scale("emails", 1, ProcessOptions::default()).await;

        for i in 0..3 {
            launcher.worker(i).exit(Some(0));
            manager.handle_next_exit().await;
        }

        assert_eq!(launcher.launched(), 4);
        assert!(manager.alerts().await.is_empty());
        assert!(!manager.pool_stats("emails").await.halted);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_ceiling_halts_and_resume_restores() {
        let options = SupervisorOptions {
            restart_limit: 2,
            ..SupervisorOptions::default()
        };
        let (manager, launcher) = manager(options);
        manager.scale("emails", 1, ProcessOptions::default()).await;

        for i in 0..3 {
            launcher.worker(i).exit(Some(1));
            manager.handle_next_exit().await;
        }

        // Two replacements, then the third crash trips the ceiling.
        assert_eq!(launcher.launched(), 3);
        let stats = manager.pool_stats("emails").await;
        assert!(stats.halted);
        assert_eq!(stats.live, 0);

        let alerts = manager.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].queue, "emails");
        assert_eq!(alerts[0].restarts, 3);

        // Scaling does not bypass the halt.
        assert_eq!(manager.scale("emails", 2, ProcessOptions::default()).await, 0);

        assert!(manager.resume("emails").await);
        assert!(manager.alerts().await.is_empty());
        assert_eq!(manager.pool_stats("emails").await.live, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_outside_the_window_are_forgotten() {
        let options = SupervisorOptions {
            restart_limit: 1,
            ..SupervisorOptions::default()
        };
        let (manager, launcher) = manager(options);
        manager.scale("emails", 1, ProcessOptions::default()).await;

        launcher.worker(0).exit(Some(1));
        manager.handle_next_exit().await;
        tokio::time::advance(Duration::from_secs(61)).await;
        launcher.worker(1).exit(Some(1));
        manager.handle_next_exit().await;

        assert!(manager.alerts().await.is_empty());
        assert_eq!(manager.pool_stats("emails").await.live, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_workers_are_killed_and_replaced() {
        let (manager, launcher) = manager(SupervisorOptions::default());
        manager.scale("emails", 1, ProcessOptions::default()).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(manager.monitor_health().await.is_empty());

        tokio::time::advance(Duration::from_secs(21)).await;
        let killed = manager.monitor_health().await;
        assert_eq!(killed, vec!["emails-1".to_string()]);
        assert!(launcher.worker(0).killed());

        manager.handle_next_exit().await;
        assert_eq!(launcher.launched(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn draining_workers_are_left_to_finish_their_job() {
        let options = SupervisorOptions {
            restart_limit: 0,
            ..SupervisorOptions::default()
        };
        let (manager, launcher) = manager(options);
        launcher.ignore_drain.store(true, Ordering::SeqCst);
        manager.scale("emails", 1, ProcessOptions::default()).await;

        launcher.worker(0).heartbeat(1.0, None, Some(5.0));
        settle().await;
        assert_eq!(manager.scale("emails", 0, ProcessOptions::default()).await, 0);
        assert!(launcher.worker(0).drained());

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(manager.monitor_health().await.is_empty());
        assert!(!launcher.worker(0).killed());

        launcher.worker(0).exit(Some(0));
        manager.handle_next_exit().await;

        let stats = manager.pool_stats("emails").await;
        assert!(!stats.halted);
        assert_eq!(stats.live, 0);
        assert!(manager.alerts().await.is_empty());
        assert_eq!(launcher.launched(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_hogs_are_killed() {
        let (manager, launcher) = manager(SupervisorOptions::default());
        let options = ProcessOptions {
            memory_limit_mb: Some(512),
            ..ProcessOptions::default()
        };
        manager.scale("emails", 2, options).await;

        launcher.worker(0).heartbeat(0.5, Some(600), None);
        launcher.worker(1).heartbeat(0.5, Some(100), None);
        settle().await;

        assert_eq!(manager.monitor_health().await, vec!["emails-1".to_string()]);
        assert!(!launcher.worker(1).killed());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_jobs_are_killed_after_timeout_and_grace() {
        let (manager, launcher) = manager(SupervisorOptions::default());
        manager.scale("emails", 1, ProcessOptions::default()).await;

        launcher.worker(0).heartbeat(1.0, None, Some(85.0));
        settle().await;
        assert!(manager.monitor_health().await.is_empty());

        launcher.worker(0).heartbeat(1.0, None, Some(95.0));
        settle().await;
        assert_eq!(manager.monitor_health().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_failures_are_retried() {
        let (manager, launcher) = manager(SupervisorOptions::default());
        launcher.failures_left.store(2, Ordering::SeqCst);

        assert_eq!(manager.scale("emails", 1, ProcessOptions::default()).await, 1);
        assert_eq!(launcher.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_gives_up_without_error() {
        let (manager, launcher) = manager(SupervisorOptions::default());
        launcher.failures_left.store(10, Ordering::SeqCst);

        assert_eq!(manager.scale("emails", 1, ProcessOptions::default()).await, 0);
        assert_eq!(launcher.attempts.load(Ordering::SeqCst), 3);
        assert_none!(manager.workers("emails").await.first());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_drains_everything() {
        let (manager, launcher) = manager(SupervisorOptions::default());
        manager.scale("emails", 2, ProcessOptions::default()).await;
        manager.scale("reports", 1, ProcessOptions::default()).await;

        manager.stop_all(Duration::from_secs(5)).await;

        assert!((0..3).all(|i| launcher.worker(i).drained()));
        assert!((0..3).all(|i| !launcher.worker(i).killed()));
        assert!(manager.workers("emails").await.is_empty());
        assert!(manager.workers("reports").await.is_empty());
        assert_eq!(launcher.launched(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_kills_stragglers() {
        let (manager, launcher) = manager(SupervisorOptions::default());
        launcher.ignore_drain.store(true, Ordering::SeqCst);
        manager.scale("emails", 1, ProcessOptions::default()).await;

        manager.stop_all(Duration::from_secs(5)).await;

        let worker = launcher.worker(0);
        assert!(worker.drained());
        assert!(worker.killed());
        assert!(manager.workers("emails").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_workers_on_shutdown() {
        let (manager, launcher) = manager(SupervisorOptions::default());
        manager.scale("emails", 1, ProcessOptions::default()).await;

        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let manager = manager.clone();
            let token = token.clone();
            async move {
                manager
                    .run(Duration::from_secs(5), token, Duration::from_secs(5))
                    .await;
            }
        });

        launcher.worker(0).exit(Some(1));
        settle().await;
        assert_eq!(launcher.launched(), 2);

        token.cancel();
        handle.await.unwrap();
        assert!(launcher.worker(1).drained());
        assert!(manager.workers("emails").await.is_empty());
    }
}
