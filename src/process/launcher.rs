use super::ProcessOptions;
use super::heartbeat::Heartbeat;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, trace, warn};

/// What to start.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    /// Supervisor-assigned worker id.
    pub worker_id: String,
    /// Queue the worker consumes.
    pub queue: String,
    /// Limits for the worker.
    pub options: ProcessOptions,
}

/// Something a supervised worker reported.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// The worker is alive.
    Heartbeat(Heartbeat),
    /// The worker is gone. `None` means it was killed by a signal.
    Exited(Option<i32>),
}

/// A running worker, owned by its supervising task.
#[async_trait]
pub trait WorkerProcess: Send + 'static {
    /// OS process id, if there is one.
    fn pid(&self) -> Option<u32>;

    /// Wait for the next event. After [`ProcessEvent::Exited`] the process
    /// must not be polled again.
    ///
    /// Must be cancel safe.
    async fn next_event(&mut self) -> ProcessEvent;

    /// Ask the worker to finish its current job and exit.
    fn drain(&mut self);

    /// Terminate the worker immediately.
    fn kill(&mut self);
}

/// Starts worker processes.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Start one worker.
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn WorkerProcess>>;
}

/// Runs `<program> [base args] work --supervised …` as a child process.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    base_args: Vec<String>,
    heartbeat_interval: Duration,
}

impl CommandLauncher {
    /// Launch `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            heartbeat_interval: Duration::from_secs(5),
        }
    }

    /// Launch the running executable again.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Arguments placed before the `work` subcommand, such as `--config`.
    pub fn base_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// How often workers should report.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// The full argument list for `spec`.
    pub fn args(&self, spec: &LaunchSpec) -> Vec<String> {
        let options = &spec.options;
        let mut args = self.base_args.clone();
        args.extend([
            "work".to_string(),
            "--supervised".to_string(),
            "--queue".to_string(),
            spec.queue.clone(),
            "--timeout".to_string(),
            options.timeout.as_secs().to_string(),
            "--sleep".to_string(),
            options.sleep.as_secs_f64().to_string(),
            "--heartbeat-interval".to_string(),
            self.heartbeat_interval.as_secs().max(1).to_string(),
        ]);
        if let Some(connection) = &options.connection {
            args.extend(["--connection".to_string(), connection.clone()]);
        }
        if let Some(memory) = options.memory_limit_mb {
            args.extend(["--memory-limit".to_string(), memory.to_string()]);
        }
        if let Some(max_jobs) = options.max_jobs {
            args.extend(["--max-jobs".to_string(), max_jobs.to_string()]);
        }
        if let Some(max_time) = options.max_time {
            args.extend(["--max-time".to_string(), max_time.as_secs().to_string()]);
        }
        if let Some(tries) = options.max_attempts {
            args.extend(["--tries".to_string(), tries.to_string()]);
        }
        args
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn WorkerProcess>> {
        let args = self.args(spec);
        debug!(program = %self.program.display(), ?args, "Launching worker process");

        let mut child = Command::new(&self.program)
            .args(&args)
            .env("WORKFORCE_WORKER_ID", &spec.worker_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout was not captured"))?;

        Ok(Box::new(ChildProcess {
            child,
            stdin,
            lines: Some(BufReader::new(stdout).lines()),
        }))
    }
}

struct ChildProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Option<Lines<BufReader<ChildStdout>>>,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn next_event(&mut self) -> ProcessEvent {
        while let Some(lines) = &mut self.lines {
            match lines.next_line().await {
                Ok(Some(line)) => match Heartbeat::parse(&line) {
                    Some(heartbeat) => return ProcessEvent::Heartbeat(heartbeat),
                    None => trace!(%line, "Ignoring worker output"),
                },
                Ok(None) => self.lines = None,
                Err(error) => {
                    debug!(%error, "Worker stdout failed");
                    self.lines = None;
                }
            }
        }

        match self.child.wait().await {
            Ok(status) => ProcessEvent::Exited(status.code()),
            Err(error) => {
                warn!(%error, "Failed to wait for worker process");
                ProcessEvent::Exited(None)
            }
        }
    }

    fn drain(&mut self) {
        // Closing stdin is the drain signal.
        self.stdin.take();
    }

    fn kill(&mut self) {
        if let Err(error) = self.child.start_kill() {
            debug!(%error, "Failed to kill worker process");
        }
    }
}
