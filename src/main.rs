use anyhow::{Context, Result, bail};
use bkmgr::core::{BackupJob, JobStore, Orchestrator, RunOutcome, orchestrator, schedule};
use bkmgr::{config, context, core::notifications, db, logging};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "bkmgr")]
#[command(about = "Scheduled file backup manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file
    #[arg(long, global = true, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Daemon(ServerArgs),
    /// Run one job now and wait for it to finish
    Run { job_id: String },
    /// Manage backup jobs
    #[command(subcommand)]
    Jobs(JobCommands),
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum JobCommands {
    List {
        #[arg(long)]
        json: bool,
    },
    Add(AddJobArgs),
    /// Change fields of an existing job; omitted fields keep their value
    Edit(EditJobArgs),
    Remove { job_id: String },
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    sync_files: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

#[derive(Args)]
struct AddJobArgs {
    #[arg(long)]
    name: String,

    /// File or directory to back up (repeatable)
    #[arg(long = "source", required = true)]
    sources: Vec<PathBuf>,

    #[arg(long)]
    destination: PathBuf,

    /// HH:MM, 24-hour
    #[arg(long)]
    time: String,

    /// Weekday name (repeatable)
    #[arg(long = "day")]
    days: Vec<String>,

    /// Recipient for run notifications (repeatable)
    #[arg(long = "email")]
    emails: Vec<String>,
}

#[derive(Args)]
struct EditJobArgs {
    job_id: String,

    #[arg(long)]
    name: Option<String>,

    /// Replaces all sources (repeatable)
    #[arg(long = "source")]
    sources: Vec<PathBuf>,

    #[arg(long)]
    destination: Option<PathBuf>,

    /// HH:MM, 24-hour
    #[arg(long)]
    time: Option<String>,

    /// Replaces all schedule days (repeatable)
    #[arg(long = "day")]
    days: Vec<String>,

    /// Replaces all recipients (repeatable)
    #[arg(long = "email")]
    emails: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) => config::AppConfig::new(&cli.config, Some(args))?,
        _ => config::AppConfig::new(&cli.config, None::<&ServerArgs>)?,
    };

    if let Commands::Config = &cli.command {
        print!("{}", config.to_redacted_toml()?);
        return Ok(());
    }

    logging::init(logging::LogConfig::from(&config))?;

    let conn = db::init(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
    let store = Arc::new(db::SqliteJobStore::new(conn));
    let notifier = notifications::create_notifier(&config.notifications);
    let ctx = context::AppContext::new(config, store.clone(), notifier);

    match cli.command {
        Commands::Daemon(_) => Orchestrator::new(ctx)
            .start()
            .await
            .context("Failed to start daemon")?,
        Commands::Run { job_id } => run_job(&ctx, &job_id).await?,
        Commands::Jobs(JobCommands::List { json }) => list_jobs(store.as_ref(), json).await?,
        Commands::Jobs(JobCommands::Add(args)) => add_job(&store, args).await?,
        Commands::Jobs(JobCommands::Edit(args)) => edit_job(&store, args).await?,
        Commands::Jobs(JobCommands::Remove { job_id }) => {
            if !store.delete_job(&job_id).await? {
                bail!("Job {} not found", job_id);
            }
            println!("Removed job {}", job_id);
        }
        Commands::Config => {}
    }

    Ok(())
}

/// Manual run: print progress, cancel on Ctrl-C, then record and notify as
/// the scheduler would.
async fn run_job(ctx: &context::AppContext, job_id: &str) -> Result<()> {
    let job = ctx.store.get_job(job_id).await?;
    let mut handle = ctx.supervisor.start(&job)?;

    let cancel = handle.cancellation_token();
    let supervisor = ctx.supervisor.clone();
    let watched_id = job.id.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            match supervisor.run_state(&watched_id) {
                Some(state) => eprintln!("Cancelling at {}%...", state.percent),
                None => eprintln!("Cancelling..."),
            }
            cancel.cancel();
        }
    });

    while let Some(progress) = handle.recv_progress().await {
        println!(
            "[{:>3}%] {}/{} {}",
            progress.percent,
            progress.files_copied,
            progress.total_files,
            progress.current_file.display()
        );
    }

    let report = handle.wait().await;
    interrupt.abort();

    for warning in &report.warnings {
        eprintln!("warning: {}", warning);
    }
    orchestrator::complete_run(ctx, &job, &report).await;

    match &report.outcome {
        RunOutcome::Success { .. } => {
            println!("Backup of {} finished: {}", job.name, report.outcome.detail());
            Ok(())
        }
        outcome => bail!("Backup of {} did not complete: {}", job.name, outcome.detail()),
    }
}

async fn list_jobs(store: &dyn JobStore, json: bool) -> Result<()> {
    let jobs = store.list_jobs().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No jobs configured");
        return Ok(());
    }

    for job in jobs {
        let last_run = job
            .last_run_at
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{}  {}  {} on {}  runs={} last={}",
            job.id,
            job.name,
            job.schedule_time,
            if job.schedule_days.is_empty() {
                "no days".to_string()
            } else {
                job.schedule_days.join(",")
            },
            job.run_count,
            last_run
        );
    }
    Ok(())
}

/// Canonical weekday names, so stored days always parse.
fn normalize_days(days: &[String]) -> Result<Vec<String>> {
    let mut normalized = Vec::with_capacity(days.len());
    for day in days {
        let weekday = schedule::parse_weekday(day)
            .with_context(|| format!("Unknown weekday {:?}", day))?;
        normalized.push(schedule::weekday_name(weekday).to_string());
    }
    Ok(normalized)
}

fn ensure_valid(job: &BackupJob) -> Result<()> {
    let problems = job.validate();
    if !problems.is_empty() {
        bail!("Invalid job:\n  {}", problems.join("\n  "));
    }
    Ok(())
}

async fn add_job(store: &db::SqliteJobStore, args: AddJobArgs) -> Result<()> {
    let days = normalize_days(&args.days)?;
    schedule::Schedule::parse(&args.time, &days)?;

    let job = BackupJob {
        id: Uuid::now_v7().to_string(),
        name: args.name,
        sources: args.sources,
        destination_root: args.destination,
        schedule_time: args.time,
        schedule_days: days,
        notify_emails: args.emails,
        last_run_at: None,
        run_count: 0,
    };

    ensure_valid(&job)?;

    let id = job.id.clone();
    store.insert_job(job).await?;
    println!("Added job {}", id);
    Ok(())
}

async fn edit_job(store: &db::SqliteJobStore, args: EditJobArgs) -> Result<()> {
    let mut job = store.get_job(&args.job_id).await?;

    if let Some(name) = args.name {
        job.name = name;
    }
    if !args.sources.is_empty() {
        job.sources = args.sources;
    }
    if let Some(destination) = args.destination {
        job.destination_root = destination;
    }
    if let Some(time) = args.time {
        job.schedule_time = time;
    }
    if !args.days.is_empty() {
        job.schedule_days = normalize_days(&args.days)?;
    }
    if !args.emails.is_empty() {
        job.notify_emails = args.emails;
    }

    ensure_valid(&job)?;

    store.update_job(job).await?;
    println!("Updated job {}", args.job_id);
    Ok(())
}
