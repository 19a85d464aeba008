use crate::BackgroundJob;
use crate::errors::QueueError;
use crate::hooks::{NoopHooks, WorkerHooks};
use crate::job::JobError;
use crate::job_registry::JobRegistry;
use crate::manager::QueueManager;
use crate::worker::{Worker, WorkerExit, WorkerOptions, WorkerStatus};
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The in-process host that runs worker loops as tokio tasks.
///
/// A runner becomes startable once at least one handler is registered.
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    manager: Arc<QueueManager>,
    queues: BTreeMap<String, Queue>,
    job_registry: JobRegistry<Context>,
    context: Context,
    hooks: Arc<dyn WorkerHooks>,
    shutdown_when_queue_empty: bool,
    shutdown: CancellationToken,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send, State: std::fmt::Debug> std::fmt::Debug
    for Runner<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("queues", &self.queues)
            .field("handlers", &self.job_registry.handlers())
            .field("context", &self.context)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish_non_exhaustive()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner over `manager` with the given context.
    pub fn new(manager: Arc<QueueManager>, context: Context) -> Self {
        Self {
            manager,
            queues: BTreeMap::new(),
            job_registry: JobRegistry::default(),
            context,
            hooks: Arc::new(NoopHooks),
            shutdown_when_queue_empty: false,
            shutdown: CancellationToken::new(),
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    fn into_state<Next>(self) -> Runner<Context, Next> {
        Runner {
            manager: self.manager,
            queues: self.queues,
            job_registry: self.job_registry,
            context: self.context,
            hooks: self.hooks,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            shutdown: self.shutdown,
            _state: PhantomData,
        }
    }

    /// Configure a queue
    pub fn configure_queue(mut self, queue_name: &str, config_fn: impl FnOnce(Queue) -> Queue) -> Self {
        self.queues
            .insert(queue_name.into(), config_fn(Queue::default()));
        self
    }

    /// Configure the manager's default queue
    pub fn configure_default_queue(self, config_fn: impl FnOnce(Queue) -> Queue) -> Self {
        let name = self.manager.default_queue().to_string();
        self.configure_queue(&name, config_fn)
    }

    /// Set the runner to shut down when the background job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Observe job outcomes.
    pub fn hooks(mut self, hooks: impl WorkerHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Stop the workers when `token` is cancelled.
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Register a job type with every queue.
    pub fn register_job_type<J: BackgroundJob<Context = Context>>(
        mut self,
    ) -> Runner<Context, Configured> {
        self.job_registry.register::<J>();
        self.into_state()
    }

    /// Register a handler that works on the raw JSON payload.
    pub fn register_handler<F, Fut>(
        mut self,
        name: impl Into<String>,
        handler: F,
    ) -> Runner<Context, Configured>
    where
        F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.job_registry.register_fn(name, handler);
        self.into_state()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Start the background workers.
    ///
    /// When no queue was configured, one worker runs on the default queue.
    pub fn start(&self) -> Result<RunHandle, QueueError> {
        let mut queues = self.queues.clone();
        if queues.is_empty() {
            queues.insert(self.manager.default_queue().to_string(), Queue::default());
        }

        let job_registry = Arc::new(self.job_registry.clone());
        let mut handles = Vec::new();
        let mut statuses = Vec::new();

        for (queue_name, queue) in &queues {
            let connection = queue.connection.as_deref();
            let driver = self.manager.driver(connection)?.clone();
            let batches = self.manager.batches(connection)?;

            for i in 1..=queue.num_workers {
                let name = format!("worker-{queue_name}-{i}");
                info!(worker.name = %name, "Starting worker…");

                let (status, receiver) = watch::channel(WorkerStatus::new());
                let worker = Worker {
                    driver: driver.clone(),
                    queue: queue_name.clone(),
                    context: self.context.clone(),
                    job_registry: job_registry.clone(),
                    hooks: self.hooks.clone(),
                    batches: batches.clone(),
                    options: queue.options.clone(),
                    shutdown: self.shutdown.clone(),
                    shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                    status,
                };

                let span = info_span!("worker", worker.name = %name, queue = %queue_name);
                let handle = tokio::spawn(async move { worker.run().instrument(span).await });

                handles.push(handle);
                statuses.push(receiver);
            }
        }

        Ok(RunHandle {
            handles,
            statuses,
            shutdown: self.shutdown.clone(),
        })
    }
}

/// Handle to a running background job processing system
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<WorkerExit>>,
    statuses: Vec<watch::Receiver<WorkerStatus>>,
    shutdown: CancellationToken,
}

impl RunHandle {
    /// Ask every worker to finish its current job and stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Live status of each worker, in start order.
    pub fn statuses(&self) -> &[watch::Receiver<WorkerStatus>] {
        &self.statuses
    }

    /// Wait for all background workers to shut down.
    pub async fn wait_for_shutdown(self) -> Vec<WorkerExit> {
        join_all(self.handles)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(exit) => Some(exit),
                Err(error) => {
                    warn!(%error, "Background worker task panicked");
                    None
                }
            })
            .collect()
    }
}

/// Configuration for the workers of one queue
#[derive(Debug, Clone)]
pub struct Queue {
    num_workers: usize,
    connection: Option<String>,
    options: WorkerOptions,
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            num_workers: 1,
            connection: None,
            options: WorkerOptions::default(),
        }
    }
}

impl Queue {
    /// Set the number of worker tasks for this queue.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Poll this connection instead of the default one.
    pub fn connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    /// Set how often workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.options.sleep = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.options.jitter = jitter;
        self
    }

    /// Replace every worker option at once.
    pub fn options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }
}
