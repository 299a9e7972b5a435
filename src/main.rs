//! Index-Harvester main entry point
//!
//! This is the command-line interface for the index harvester: task control,
//! credential administration and the long-running scheduler loop.

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use index_harvester::config::{load_config_with_hash, Config};
use index_harvester::credential::{parse_cookie_string, CredentialPool, MemoryCache};
use index_harvester::crawler::EngineContext;
use index_harvester::output::{load_statistics, print_statistics};
use index_harvester::scheduler::{ControlOutcome, TaskRequest, TaskScheduler};
use index_harvester::state::{RawTaskParameters, TaskStatus, TaskType};
use index_harvester::storage::open_storage;
use index_harvester::SharedStorage;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Index-Harvester: a resumable harvester for a rate-limited index service
///
/// Tasks are created and controlled from the command line and processed by
/// `run`, which rotates the credential pool and checkpoints every finished
/// work item so interrupted tasks can be resumed.
#[derive(Parser, Debug)]
#[command(name = "index-harvester")]
#[command(version = "1.0.0")]
#[command(about = "A resumable harvester for a rate-limited index service", long_about = None)]
struct Cli {
    /// Path to TOML configuration file (defaults apply when omitted)
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process queued tasks until the queue drains or Ctrl-C is pressed
    Run {
        /// JSON file holding an array of task requests to enqueue first
        #[arg(long, value_name = "FILE")]
        tasks: Option<PathBuf>,

        /// Keep polling for new tasks instead of exiting when idle
        #[arg(long)]
        watch: bool,
    },

    /// Create, inspect and control tasks
    #[command(subcommand)]
    Task(TaskCommand),

    /// Administer the credential pool
    #[command(subcommand)]
    Credential(CredentialCommand),

    /// Show task and credential statistics from the database
    Stats,
}

#[derive(Subcommand, Debug)]
enum TaskCommand {
    /// Create a task; it runs on the next `run`
    Create(CreateArgs),

    /// Show a task and the tail of its log
    Get { task_id: String },

    /// List tasks, newest first
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
    },

    Pause { task_id: String },

    Resume { task_id: String },

    Cancel { task_id: String },
}

#[derive(Args, Debug)]
struct CreateArgs {
    /// search-index, feed-index, word-graph, demographic-attributes,
    /// interest-profile or region-distribution
    #[arg(long = "type", value_name = "TYPE")]
    task_type: TaskType,

    /// Keyword to harvest (repeatable)
    #[arg(short, long = "keyword")]
    keywords: Vec<String>,

    /// Look back this many days from today
    #[arg(long)]
    days: Option<u32>,

    #[arg(long, default_value_t = 0)]
    priority: i32,

    /// Full parameter object as JSON; --keyword and --days override its fields
    #[arg(long, value_name = "JSON")]
    params: Option<String>,
}

#[derive(Subcommand, Debug)]
enum CredentialCommand {
    /// Add a credential or refresh an existing one
    Add {
        id: String,

        /// Session cookies, e.g. "BDUSS=...; BAIDUID=..."
        #[arg(long)]
        cookie: String,

        /// Expire the credential after this many days
        #[arg(long)]
        expire_days: Option<u32>,
    },

    /// Ban a credential, permanently unless a duration is given
    Ban {
        id: String,

        #[arg(long, value_name = "SECS")]
        duration: Option<u64>,
    },

    /// Lift a temporary ban
    Unban { id: String },

    /// Lift any ban, permanent ones included
    ForceUnban { id: String },

    Delete { id: String },

    List,

    /// Show pool-wide counts
    Status,

    /// Delete expired credentials
    Cleanup,

    /// Reconcile the availability cache with the database
    Sync,

    /// Show requests per credential and day
    Usage {
        /// Only show this credential
        #[arg(long)]
        id: Option<String>,

        /// First day; defaults to six days before --to
        #[arg(long, value_name = "YYYY-MM-DD")]
        from: Option<NaiveDate>,

        /// Last day; defaults to today
        #[arg(long, value_name = "YYYY-MM-DD")]
        to: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    let config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            match load_config_with_hash(path) {
                Ok((cfg, hash)) => {
                    tracing::info!("Configuration loaded successfully (hash: {})", hash);
                    cfg
                }
                Err(e) => {
                    tracing::error!("Failed to load configuration: {}", e);
                    return Err(e.into());
                }
            }
        }
        None => Config::default(),
    };

    let storage = open_shared_storage(&config)?;

    match cli.command {
        Command::Run { tasks, watch } => handle_run(config, storage, tasks, watch).await?,
        Command::Task(command) => handle_task(config, storage, command)?,
        Command::Credential(command) => handle_credential(&config, storage, command)?,
        Command::Stats => handle_stats(&config, storage)?,
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("index_harvester=info,warn"),
            1 => EnvFilter::new("index_harvester=debug,info"),
            _ => EnvFilter::new("index_harvester=trace,debug"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn open_shared_storage(config: &Config) -> anyhow::Result<SharedStorage> {
    let path = Path::new(&config.storage.database_path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    let storage = open_storage(path)
        .with_context(|| format!("opening database {}", config.storage.database_path))?;
    Ok(Arc::new(Mutex::new(storage)))
}

fn build_pool(config: &Config, storage: SharedStorage) -> anyhow::Result<Arc<CredentialPool>> {
    let pool = Arc::new(CredentialPool::new(
        storage,
        Arc::new(MemoryCache::new()),
        &config.pool,
    ));
    let report = pool.sync().context("loading credentials")?;
    tracing::info!(
        "Credential pool ready: {}/{} available",
        report.available,
        report.total
    );
    Ok(pool)
}

fn build_scheduler(config: Config, storage: SharedStorage) -> anyhow::Result<Arc<TaskScheduler>> {
    let pool = build_pool(&config, storage.clone())?;
    let ctx = EngineContext::new(Arc::new(config), storage, pool)
        .context("building upstream client")?;
    Ok(Arc::new(TaskScheduler::new(ctx)))
}

/// Handles `run`: enqueues tasks from a file, then dispatches until done
async fn handle_run(
    config: Config,
    storage: SharedStorage,
    tasks: Option<PathBuf>,
    watch: bool,
) -> anyhow::Result<()> {
    let sync_interval = config.pool.sync_interval();
    let scheduler = build_scheduler(config, storage)?;

    if let Some(path) = tasks {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading task file {}", path.display()))?;
        let requests: Vec<TaskRequest> = serde_json::from_str(&content)
            .with_context(|| format!("parsing task file {}", path.display()))?;

        for request in requests {
            match scheduler.create(request) {
                Ok(id) => println!("Created task {}", id),
                Err(e) => tracing::error!("Skipping task: {}", e),
            }
        }
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Shutdown requested; flushing running tasks");
            signal.cancel();
        }
    });

    let sync_loop = scheduler
        .context()
        .pool
        .spawn_sync_loop(sync_interval, shutdown.clone());

    Arc::clone(&scheduler).run(shutdown.clone(), !watch).await?;

    shutdown.cancel();
    // Books the usage of this run before exiting
    if let Err(e) = scheduler.context().pool.sync() {
        tracing::warn!("Final credential sync failed: {}", e);
    }
    if let Err(e) = sync_loop.await {
        tracing::debug!("Credential sync loop ended abnormally: {}", e);
    }
    Ok(())
}

/// Handles `task ...` subcommands
fn handle_task(config: Config, storage: SharedStorage, command: TaskCommand) -> anyhow::Result<()> {
    let scheduler = build_scheduler(config, storage)?;

    match command {
        TaskCommand::Create(args) => {
            let request = create_request(args)?;
            let id = scheduler.create(request)?;
            println!("{}", id);
        }
        TaskCommand::Get { task_id } => {
            let view = scheduler.get(&task_id)?;
            let task = &view.task;
            println!("Task:       {}", task.task_id);
            println!("Type:       {}", task.task_type);
            println!("Status:     {}", task.status);
            println!("Priority:   {}", task.priority);
            println!(
                "Progress:   {:.1}% ({} completed, {} failed, {} total)",
                task.progress, task.completed_items, task.failed_items, task.total_items
            );
            if let Some(from) = &task.checkpoint_ref {
                println!("Resumes:    {}", from);
            }
            println!("Created:    {}", task.create_time);
            if let Some(start) = task.start_time {
                println!("Started:    {}", start);
            }
            if let Some(end) = task.end_time {
                println!("Ended:      {}", end);
            }
            if let Some(message) = &task.error_message {
                println!("Message:    {}", message);
            }
            for file in &task.output_files {
                println!("Output:     {}", file);
            }
            println!("Parameters: {}", task.parameters);

            if !view.logs.is_empty() {
                println!("\nLog:");
                for entry in &view.logs {
                    println!(
                        "  {} [{}] {}",
                        entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.level,
                        entry.message
                    );
                }
            }
        }
        TaskCommand::List { status } => {
            let tasks = scheduler.list(status)?;
            if tasks.is_empty() {
                println!("No tasks");
            }
            for task in tasks {
                println!(
                    "{}  {:<22} {:<10} {:>6.1}%  priority {}",
                    task.task_id, task.task_type, task.status, task.progress, task.priority
                );
            }
        }
        TaskCommand::Pause { task_id } => {
            report_control("pause", &task_id, scheduler.pause(&task_id)?)
        }
        TaskCommand::Resume { task_id } => {
            report_control("resume", &task_id, scheduler.resume(&task_id)?)
        }
        TaskCommand::Cancel { task_id } => {
            report_control("cancel", &task_id, scheduler.cancel(&task_id)?)
        }
    }

    Ok(())
}

fn create_request(args: CreateArgs) -> anyhow::Result<TaskRequest> {
    let mut parameters = match &args.params {
        Some(json) => serde_json::from_str::<RawTaskParameters>(json)
            .context("parsing --params as a task parameter object")?,
        None => RawTaskParameters::default(),
    };
    if !args.keywords.is_empty() {
        parameters.keywords = args.keywords;
    }
    if args.days.is_some() {
        parameters.days = args.days;
    }
    if parameters.keywords.is_empty() && !parameters.resume {
        bail!("at least one --keyword is required");
    }

    Ok(TaskRequest {
        task_type: args.task_type,
        parameters,
        priority: args.priority,
    })
}

fn report_control(action: &str, task_id: &str, outcome: ControlOutcome) {
    match outcome {
        ControlOutcome::Applied => println!("{}: {} requested", task_id, action),
        ControlOutcome::NoOp => println!("{}: nothing to {}", task_id, action),
    }
}

/// Handles `credential ...` subcommands
fn handle_credential(
    config: &Config,
    storage: SharedStorage,
    command: CredentialCommand,
) -> anyhow::Result<()> {
    let pool = build_pool(config, storage)?;

    match command {
        CredentialCommand::Add {
            id,
            cookie,
            expire_days,
        } => {
            let credential = pool.add(&id, parse_cookie_string(&cookie), expire_days)?;
            println!(
                "Added {} ({} cookie field(s))",
                credential.id,
                credential.fields.len()
            );
        }
        CredentialCommand::Ban { id, duration } => match duration {
            Some(secs) => {
                pool.ban_temporary(&id, Duration::from_secs(secs))?;
                println!("Banned {} for {}s", id, secs);
            }
            None => {
                pool.ban_permanent(&id)?;
                println!("Banned {} permanently", id);
            }
        },
        CredentialCommand::Unban { id } => {
            if pool.unban(&id)? {
                println!("Unbanned {}", id);
            } else {
                println!("{} is permanently banned; use force-unban", id);
            }
        }
        CredentialCommand::ForceUnban { id } => {
            pool.force_unban(&id)?;
            println!("Unbanned {}", id);
        }
        CredentialCommand::Delete { id } => {
            if !pool.delete(&id)? {
                bail!("credential {} not found", id);
            }
            println!("Deleted {}", id);
        }
        CredentialCommand::List => {
            let now = chrono::Utc::now();
            for credential in pool.list()? {
                let state = if credential.is_permanently_banned {
                    "banned".to_string()
                } else if let Some(until) = credential.temp_ban_until.filter(|u| *u > now) {
                    format!("cooling down until {}", until.format("%Y-%m-%d %H:%M:%S"))
                } else if credential.is_expired(now) {
                    "expired".to_string()
                } else if credential.is_available {
                    "available".to_string()
                } else {
                    "unavailable".to_string()
                };
                println!(
                    "{:<24} {:<40} used {}",
                    credential.id, state, credential.usage_count
                );
            }
        }
        CredentialCommand::Status => {
            let status = pool.status()?;
            println!("Total:        {}", status.total);
            println!("Available:    {}", status.available);
            println!("Cooling down: {}", status.temp_banned);
            println!("Banned:       {}", status.perm_banned);
            println!("Expired:      {}", status.expired);
        }
        CredentialCommand::Cleanup => {
            let removed = pool.cleanup_expired()?;
            println!("Removed {} expired credential(s)", removed.len());
        }
        CredentialCommand::Sync => {
            let report = pool.sync()?;
            println!(
                "{}/{} available, {} released, {} evicted",
                report.available, report.total, report.released, report.evicted
            );
        }
        CredentialCommand::Usage { id, from, to } => {
            let to = to.unwrap_or_else(|| chrono::Local::now().date_naive());
            let from = from.unwrap_or_else(|| {
                to.checked_sub_signed(chrono::Duration::days(6))
                    .unwrap_or(NaiveDate::MIN)
            });
            if from > to {
                bail!("--from {} is after --to {}", from, to);
            }

            let usage = pool.usage_between(id.as_deref(), from, to)?;
            if usage.is_empty() {
                println!("No usage between {} and {}", from, to);
            }
            for day in &usage {
                println!("{}  {:<24} {}", day.usage_date, day.credential_id, day.count);
            }
            let total: u64 = usage.iter().map(|u| u.count).sum();
            println!("Total: {} request(s) from {} to {}", total, from, to);
        }
    }

    Ok(())
}

/// Handles `stats`: shows statistics from the database
fn handle_stats(config: &Config, storage: SharedStorage) -> anyhow::Result<()> {
    println!("Database: {}\n", config.storage.database_path);

    let pool = build_pool(config, storage.clone())?;
    let stats = load_statistics(&storage, &pool)?;
    print_statistics(&stats);

    Ok(())
}
