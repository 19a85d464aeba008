use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use workforce::autoscaler::AutoScaler;
use workforce::config::{Config, DriverKind};
use workforce::process::{CommandLauncher, ProcessManager, heartbeat};
use workforce::store::FailedJobQuery;
use workforce::store::postgres::PgDriver;
use workforce::{
    FailedJobPruner, NewJob, QueueManager, Runner, ShellJob, WorkerExit, install_shutdown_handler,
    setup_database,
};

#[derive(Parser, Debug)]
#[command(name = "workforce")]
#[command(version)]
#[command(about = "Durable background jobs with supervised, auto-scaled workers")]
#[command(propagate_version = true)]
struct Args {
    /// Path to the YAML configuration
    #[arg(long, short = 'c', global = true, env = "WORKFORCE_CONFIG", default_value = "workforce.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process jobs from one queue
    Work(WorkArgs),

    /// Run and supervise worker processes for every configured queue
    Supervise {
        /// Worker count for a queue (format: "queue=N"); forced within the
        /// scaling bounds for auto-scaled queues
        #[arg(long = "scale", value_parser = parse_scale)]
        scale: Vec<(String, usize)>,
    },

    /// Enqueue a job
    Enqueue(EnqueueArgs),

    /// Show queue counts as JSON
    Stats {
        /// Only this queue (default: all queues)
        #[arg(long)]
        queue: Option<String>,

        /// Connection to inspect
        #[arg(long)]
        connection: Option<String>,
    },

    /// Inspect and recover failed jobs
    Failed {
        /// Connection holding the failed jobs
        #[arg(long, global = true)]
        connection: Option<String>,

        #[command(subcommand)]
        command: FailedCommands,
    },

    /// Check every configured connection
    Health,

    /// Create the tables on every Postgres connection
    Migrate,
}

#[derive(Parser, Debug)]
struct WorkArgs {
    /// Queue to consume (default: the configured default queue)
    #[arg(long)]
    queue: Option<String>,

    /// Connection to consume from
    #[arg(long)]
    connection: Option<String>,

    /// Retire once resident memory exceeds this many megabytes
    #[arg(long)]
    memory_limit: Option<u64>,

    /// Handler timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Retire after this many jobs
    #[arg(long)]
    max_jobs: Option<u64>,

    /// Retire after this many seconds
    #[arg(long)]
    max_time: Option<u64>,

    /// Attempt ceiling for every job
    #[arg(long)]
    tries: Option<i32>,

    /// Seconds to sleep after an empty poll, fractions allowed
    #[arg(long)]
    sleep: Option<f64>,

    /// Report heartbeats on stdout and drain when stdin closes
    #[arg(long)]
    supervised: bool,

    /// Seconds between heartbeats in supervised mode
    #[arg(long, default_value = "5")]
    heartbeat_interval: u64,
}

#[derive(Parser, Debug)]
struct EnqueueArgs {
    /// Registered handler name, e.g. "shell"
    handler: String,

    /// JSON payload
    payload: String,

    /// Target queue
    #[arg(long)]
    queue: Option<String>,

    /// Target connection
    #[arg(long)]
    connection: Option<String>,

    /// Seconds before the job becomes visible
    #[arg(long, default_value = "0")]
    delay: u64,

    /// Higher runs first
    #[arg(long, default_value = "0")]
    priority: i16,

    /// Attempts allowed
    #[arg(long)]
    max_attempts: Option<i32>,
}

#[derive(Subcommand, Debug)]
enum FailedCommands {
    /// List failed jobs, newest first
    List {
        /// Only this queue
        #[arg(long)]
        queue: Option<String>,

        /// Maximum number of records
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Put a failed job back on its queue
    Retry {
        /// Failed job ID
        id: String,
    },

    /// Delete a failed job
    Forget {
        /// Failed job ID
        id: String,
    },

    /// Delete failed jobs older than the given number of hours
    Prune {
        /// Age in hours (default: the configured retention)
        #[arg(long)]
        hours: Option<u64>,
    },
}

fn parse_scale(value: &str) -> Result<(String, usize), String> {
    let (queue, count) = value
        .split_once('=')
        .ok_or_else(|| format!("expected queue=N, got `{value}`"))?;
    let count = count
        .parse()
        .map_err(|_| format!("invalid worker count `{count}`"))?;
    Ok((queue.to_string(), count))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr: stdout carries heartbeats and command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,workforce=info")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    match args.command {
        Commands::Work(work) => run_worker(&config, work).await,
        Commands::Supervise { scale } => run_supervisor(&config, &args.config, scale).await,
        Commands::Enqueue(enqueue) => run_enqueue(&config, enqueue).await,
        Commands::Stats { queue, connection } => {
            let manager = config.connect().await?;
            let stats = manager
                .stats(queue.as_deref(), connection.as_deref())
                .await?;
            print_json(&stats)
        }
        Commands::Failed {
            connection,
            command,
        } => run_failed(&config, connection.as_deref(), command).await,
        Commands::Health => run_health(&config).await,
        Commands::Migrate => run_migrate(&config).await,
    }
}

async fn run_worker(config: &Config, args: WorkArgs) -> anyhow::Result<()> {
    let manager = Arc::new(config.connect().await?);
    let queue = args
        .queue
        .unwrap_or_else(|| manager.default_queue().to_string());
    let queue_config = config.queue(&queue);

    let mut options = queue_config.workers.worker_options();
    if let Some(timeout) = args.timeout {
        options = options.timeout(Duration::from_secs(timeout));
    }
    if let Some(sleep) = args.sleep {
        options = options.sleep(Duration::try_from_secs_f64(sleep)?);
    }
    if let Some(max_jobs) = args.max_jobs {
        options = options.max_jobs(max_jobs);
    }
    if let Some(max_time) = args.max_time {
        options = options.max_time(Duration::from_secs(max_time));
    }
    if let Some(memory) = args.memory_limit {
        options = options.memory_limit_mb(memory);
    }
    if let Some(tries) = args.tries {
        options = options.max_attempts(tries);
    }
    let connection = args.connection.or(queue_config.connection);
    let concurrency = queue_config.workers.concurrency;

    let shutdown = install_shutdown_handler()?;
    let runner = Runner::new(manager, ())
        .shutdown_token(shutdown.clone())
        .configure_queue(&queue, |q| {
            let q = q.num_workers(concurrency).options(options);
            match connection {
                Some(connection) => q.connection(connection),
                None => q,
            }
        })
        .register_job_type::<ShellJob>();

    let handle = runner.start()?;
    info!(%queue, workers = concurrency, supervised = args.supervised, "Worker started");

    // Heartbeats outlive the drain so the supervisor can see the last job finish.
    let heartbeats = CancellationToken::new();
    if args.supervised {
        let interval = Duration::from_secs(args.heartbeat_interval.max(1));
        tokio::spawn(heartbeat::emit_heartbeats(
            handle.statuses().to_vec(),
            interval,
            heartbeats.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(heartbeat::drain_on_stdin_close(shutdown.clone()));
    }

    let exits = handle.wait_for_shutdown().await;
    heartbeats.cancel();
    shutdown.cancel();
    for exit in &exits {
        if let WorkerExit::Retired(reason) = exit {
            info!(%queue, %reason, "Worker retired");
        }
    }
    Ok(())
}

async fn run_supervisor(
    config: &Config,
    config_path: &std::path::Path,
    scale: Vec<(String, usize)>,
) -> anyhow::Result<()> {
    let manager = Arc::new(config.connect().await?);
    let supervisor = &config.supervisor;
    let shutdown = install_shutdown_handler()?;

    let launcher = CommandLauncher::current_exe()?
        .base_args(["--config".to_string(), config_path.display().to_string()])
        .heartbeat_interval(Duration::from_secs(supervisor.heartbeat_interval));
    let processes = ProcessManager::new(launcher, supervisor.supervisor_options());

    let fixed: BTreeMap<String, usize> = scale.into_iter().collect();
    let mut scaler = AutoScaler::new(manager.clone(), processes.clone());
    for (name, queue) in &config.queues {
        let options = config.process_options(name);
        match &queue.scaling {
            Some(policy) => scaler = scaler.queue(name.clone(), policy.clone(), options)?,
            None => {
                let target = fixed.get(name).copied().unwrap_or(1);
                let live = processes.scale(name, target, options).await;
                info!(queue = %name, workers = live, "Started fixed worker pool");
            }
        }
    }
    for (name, target) in &fixed {
        match config.queues.get(name) {
            Some(queue) if queue.scaling.is_some() => {
                if let Some(decision) = scaler.force_scale(name, *target, "--scale").await {
                    info!(queue = %name, workers = decision.target, "Forced worker pool size");
                }
            }
            Some(_) => {}
            None => warn!(queue = %name, "Ignoring --scale for a queue that is not configured"),
        }
    }
    if config.queues.is_empty() {
        let queue = manager.default_queue().to_string();
        let live = processes
            .scale(&queue, 1, config.process_options(&queue))
            .await;
        info!(%queue, workers = live, "Started default worker pool");
    }

    let pruner = FailedJobPruner::new(manager.clone(), config.failed_jobs.retention())
        .interval(config.failed_jobs.prune_interval())
        .start(shutdown.clone());

    info!("Supervisor running");
    tokio::join!(
        scaler.run(
            Duration::from_secs(supervisor.scale_interval),
            shutdown.clone()
        ),
        processes.run(
            Duration::from_secs(supervisor.health_interval),
            shutdown.clone(),
            Duration::from_secs(supervisor.stop_timeout),
        ),
    );

    if let Err(error) = pruner.await {
        warn!(%error, "Failed job pruner panicked");
    }
    info!("Supervisor stopped");
    Ok(())
}

async fn run_enqueue(config: &Config, args: EnqueueArgs) -> anyhow::Result<()> {
    let manager = config.connect().await?;
    let payload =
        serde_json::from_str(&args.payload).context("payload must be valid JSON")?;

    let mut job = NewJob::new(args.handler, payload)
        .delay(Duration::from_secs(args.delay))
        .priority(args.priority);
    if let Some(queue) = args.queue {
        job = job.on_queue(queue);
    }
    if let Some(max_attempts) = args.max_attempts {
        job = job.max_attempts(max_attempts);
    }

    let id = manager.dispatch_to(args.connection.as_deref(), job).await?;
    println!("{id}");
    Ok(())
}

async fn run_failed(
    config: &Config,
    connection: Option<&str>,
    command: FailedCommands,
) -> anyhow::Result<()> {
    let manager = config.connect().await?;
    match command {
        FailedCommands::List { queue, limit } => {
            let query = FailedJobQuery {
                queue,
                limit: Some(limit),
            };
            print_json(&manager.failed_jobs(&query, connection).await?)
        }
        FailedCommands::Retry { id } => match manager.retry_failed(&id, connection).await? {
            Some(job_id) => {
                println!("{job_id}");
                Ok(())
            }
            None => bail!("failed job {id} not found"),
        },
        FailedCommands::Forget { id } => {
            if !manager.forget_failed(&id, connection).await? {
                bail!("failed job {id} not found");
            }
            Ok(())
        }
        FailedCommands::Prune { hours } => {
            let older_than = hours
                .map(|hours| Duration::from_secs(hours * 3600))
                .unwrap_or_else(|| config.failed_jobs.retention());
            let pruned = manager.prune_failed(older_than, connection).await?;
            println!("{pruned}");
            Ok(())
        }
    }
}

async fn run_health(config: &Config) -> anyhow::Result<()> {
    let manager: QueueManager = config.connect().await?;
    let names: Vec<String> = manager.connection_names().map(String::from).collect();

    let mut reports = Vec::with_capacity(names.len());
    for name in &names {
        reports.push(manager.test_connection(Some(name.as_str())).await?);
    }
    print_json(&reports)?;

    let unhealthy = reports.iter().filter(|report| !report.healthy).count();
    if unhealthy > 0 {
        bail!("{unhealthy} of {} connections are unhealthy", reports.len());
    }
    Ok(())
}

async fn run_migrate(config: &Config) -> anyhow::Result<()> {
    let mut migrated = 0;
    for (name, connection) in &config.connections {
        if connection.driver != DriverKind::Postgres {
            continue;
        }
        let url = connection.url(name)?;
        let driver = PgDriver::connect(&url, name.clone()).await?;
        setup_database(driver.pool())
            .await
            .with_context(|| format!("migrating connection `{name}`"))?;
        info!(connection = %name, "Migrations applied");
        migrated += 1;
    }
    if migrated == 0 {
        warn!("No Postgres connections configured, nothing to migrate");
    }
    Ok(())
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
