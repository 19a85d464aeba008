//! The line protocol between a supervised worker and its supervisor.
//!
//! A supervised worker writes one JSON [`Heartbeat`] per line to stdout and
//! drains once its stdin reaches end of file.

use crate::util::resident_memory_mb;
use crate::worker::{WorkerState, WorkerStatus};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One liveness report from a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Reporting process.
    pub pid: u32,
    /// State of the process's busiest worker loop.
    pub state: WorkerState,
    /// Jobs processed since the process started.
    pub jobs_processed: u64,
    /// Resident memory in megabytes, when the platform reports it.
    pub memory_mb: Option<u64>,
    /// Mean share of time spent executing handlers, in `0..=1`.
    pub utilization: f64,
    /// Seconds the longest-running current job has been executing.
    pub current_job_secs: Option<f64>,
}

impl Heartbeat {
    /// Summarize the worker loops of this process.
    pub fn collect(statuses: &[watch::Receiver<WorkerStatus>]) -> Self {
        let snapshots: Vec<WorkerStatus> = statuses.iter().map(|rx| rx.borrow().clone()).collect();

        let state = snapshots
            .iter()
            .map(|status| status.state)
            .max_by_key(|state| state_rank(*state))
            .unwrap_or(WorkerState::Idle);
        let utilization = if snapshots.is_empty() {
            0.0
        } else {
            snapshots.iter().map(WorkerStatus::utilization).sum::<f64>() / snapshots.len() as f64
        };
        let current_job_secs = snapshots
            .iter()
            .filter_map(WorkerStatus::current_job_elapsed)
            .max()
            .map(|elapsed| elapsed.as_secs_f64());

        Self {
            pid: std::process::id(),
            state,
            jobs_processed: snapshots.iter().map(|status| status.jobs_processed).sum(),
            memory_mb: resident_memory_mb(),
            utilization,
            current_job_secs,
        }
    }

    /// Parse one stdout line. Anything that is not a heartbeat yields `None`.
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }

    /// How long the current job has been running.
    pub fn current_job_elapsed(&self) -> Option<Duration> {
        self.current_job_secs
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
    }
}

fn state_rank(state: WorkerState) -> u8 {
    match state {
        WorkerState::Stopped => 0,
        WorkerState::Idle => 1,
        WorkerState::Reserving => 2,
        WorkerState::Draining => 3,
        WorkerState::Acking | WorkerState::Releasing | WorkerState::Failing => 4,
        WorkerState::Executing => 5,
    }
}

/// Write a heartbeat to stdout every `interval` until `stop` fires.
///
/// Keeps reporting while the worker drains. If stdout is gone, cancels
/// `shutdown` so the worker stops too.
pub async fn emit_heartbeats(
    statuses: Vec<watch::Receiver<WorkerStatus>>,
    interval: Duration,
    stop: CancellationToken,
    shutdown: CancellationToken,
) {
    let mut stdout = tokio::io::stdout();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let heartbeat = Heartbeat::collect(&statuses);
        let mut line = match serde_json::to_vec(&heartbeat) {
            Ok(line) => line,
            Err(error) => {
                warn!(%error, "Failed to serialize heartbeat");
                continue;
            }
        };
        line.push(b'\n');

        if let Err(error) = write_line(&mut stdout, &line).await {
            // Nobody is listening any more.
            debug!(%error, "Failed to write heartbeat");
            shutdown.cancel();
            break;
        }
    }
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &[u8]) -> std::io::Result<()> {
    stdout.write_all(line).await?;
    stdout.flush().await
}

/// Cancel `shutdown` once stdin reaches end of file.
pub async fn drain_on_stdin_close(shutdown: CancellationToken) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 256];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            read = stdin.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }
    debug!("Supervisor closed stdin, draining");
    shutdown.cancel();
}
