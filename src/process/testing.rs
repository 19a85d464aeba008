//! In-process stand-ins for worker processes.

use super::{Heartbeat, LaunchSpec, Launcher, ProcessEvent, WorkerProcess};
use crate::worker::WorkerState;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

#[derive(Clone)]
pub(crate) struct FakeWorker {
    events: mpsc::UnboundedSender<ProcessEvent>,
    drained: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
}

impl FakeWorker {
    pub(crate) fn heartbeat(&self, utilization: f64, memory_mb: Option<u64>, current_job_secs: Option<f64>) {
        let _ = self.events.send(ProcessEvent::Heartbeat(Heartbeat {
            pid: 1,
            state: WorkerState::Idle,
            jobs_processed: 10,
            memory_mb,
            utilization,
            current_job_secs,
        }));
    }

    pub(crate) fn exit(&self, code: Option<i32>) {
        let _ = self.events.send(ProcessEvent::Exited(code));
    }

    pub(crate) fn drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    pub(crate) fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

struct FakeProcess {
    worker: FakeWorker,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
    ignore_drain: bool,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    async fn next_event(&mut self) -> ProcessEvent {
        self.events.recv().await.unwrap_or(ProcessEvent::Exited(None))
    }

    fn drain(&mut self) {
        self.worker.drained.store(true, Ordering::SeqCst);
        if !self.ignore_drain {
            self.worker.exit(Some(0));
        }
    }

    fn kill(&mut self) {
        self.worker.killed.store(true, Ordering::SeqCst);
        self.worker.exit(None);
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeLauncher {
    launched: Arc<std::sync::Mutex<Vec<FakeWorker>>>,
    pub(crate) attempts: Arc<AtomicU64>,
    pub(crate) failures_left: Arc<AtomicU64>,
    pub(crate) ignore_drain: Arc<AtomicBool>,
}

impl FakeLauncher {
    pub(crate) fn worker(&self, index: usize) -> FakeWorker {
        self.launched.lock().unwrap()[index].clone()
    }

    pub(crate) fn launched(&self) -> usize {
        self.launched.lock().unwrap().len()
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, _spec: &LaunchSpec) -> io::Result<Box<dyn WorkerProcess>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(io::Error::other("no more processes"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = FakeWorker {
            events: tx,
            drained: Arc::default(),
            killed: Arc::default(),
        };
        self.launched.lock().unwrap().push(worker.clone());
        Ok(Box::new(FakeProcess {
            worker,
            events: rx,
            ignore_drain: self.ignore_drain.load(Ordering::SeqCst),
        }))
    }
}

