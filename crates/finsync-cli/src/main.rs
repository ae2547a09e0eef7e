//! finsync command-line interface.
//!
//! `finsync worker` runs the worker pool until Ctrl-C; every other command is
//! a one-shot call against the job service or the connection store.

mod app;
mod telemetry;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use finsync_core::config::AppConfig;
use finsync_core::domain::connection::credentials_aad;
use finsync_core::domain::{
    AnalysisArgs, AnalysisType, Connection, ConnectionId, ConnectionStatus, DateRange, JobId,
    JobKind, JobRecord, JobState, MaintenanceArgs, MaintenanceTask, NotifyChannel,
    OrganizationId, RangePreset, SyncArgs,
};
use finsync_core::ports::{
    CancelOutcome, ConnectionStore, IdGenerator, JobFilter, SystemClock, UlidGenerator,
};
use finsync_core::providers::SimpleFinClient;
use finsync_core::providers::simplefin::{ACCESS_URL_FIELD, PROVIDER_TYPE};
use finsync_core::service::EnqueueReceipt;
use finsync_core::vault::{Credentials, VaultKey};

use app::App;

/// Finance tracker job queue and provider sync
#[derive(Parser)]
#[command(name = "finsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true, env = "FINSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool until interrupted
    Worker {
        /// Serve only these queues (repeatable)
        #[arg(short, long = "queue")]
        queues: Vec<String>,
    },

    /// Enqueue a job
    #[command(subcommand)]
    Enqueue(EnqueueCommand),

    /// Inspect and cancel jobs
    #[command(subcommand)]
    Jobs(JobsCommand),

    /// Job counts per queue
    Stats,

    /// Check that the job store is reachable
    Health,

    /// Manage provider connections
    #[command(subcommand)]
    Connection(ConnectionCommand),

    /// Print a new base64 vault key
    Keygen {
        /// Version to label the key with
        #[arg(long, default_value = "1")]
        key_version: u32,
    },
}

#[derive(Subcommand)]
enum EnqueueCommand {
    /// Sync one connection
    Sync {
        #[arg(long)]
        org: OrganizationId,

        #[arg(long)]
        connection: ConnectionId,

        /// Restrict to one provider account
        #[arg(long)]
        account: Option<String>,

        /// Range start (YYYY-MM-DD); requires --end
        #[arg(long, requires = "end")]
        start: Option<NaiveDate>,

        /// Range end (YYYY-MM-DD); requires --start
        #[arg(long, requires = "start")]
        end: Option<NaiveDate>,
    },

    /// Run an AI analysis for an organization
    Analysis {
        #[arg(long)]
        org: OrganizationId,

        #[arg(long, value_enum, default_value_t = RangeArg::CurrentMonth)]
        range: RangeArg,

        /// Start of a custom range (with --range custom)
        #[arg(long)]
        start: Option<NaiveDate>,

        /// End of a custom range (with --range custom)
        #[arg(long)]
        end: Option<NaiveDate>,

        #[arg(long = "type", value_enum, default_value_t = AnalysisTypeArg::Spending)]
        analysis_type: AnalysisTypeArg,

        /// Send the summary to ntfy
        #[arg(long)]
        notify: bool,

        /// Do nothing when the ledger has not changed since the last analysis
        #[arg(long)]
        skip_if_unchanged: bool,
    },

    /// Run a maintenance task now
    Maintenance {
        #[arg(value_enum)]
        task: TaskArg,

        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum JobsCommand {
    /// List jobs, newest first
    List {
        #[arg(long)]
        queue: Option<String>,

        #[arg(long)]
        state: Option<JobState>,

        #[arg(long)]
        kind: Option<JobKind>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Show one job as JSON
    Get { id: JobId },

    /// Cancel a job
    Cancel { id: JobId },
}

#[derive(Subcommand)]
enum ConnectionCommand {
    /// Store a new SimpleFIN connection
    Add(AddConnection),

    /// Show a connection (never its credentials)
    Show { id: ConnectionId },

    /// Re-encrypt a connection's credentials under the current vault key
    Reseal { id: ConnectionId },

    /// Enqueue a connection test (lists accounts, writes nothing to the ledger)
    Test {
        id: ConnectionId,

        /// Also fetch the first account's last week of transactions
        #[arg(long)]
        sample_transactions: bool,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false, args = ["setup_token", "access_url"])]
struct AddConnection {
    #[arg(long)]
    org: OrganizationId,

    /// Display name
    #[arg(long)]
    name: String,

    /// One-time SimpleFIN setup token to claim
    #[arg(long)]
    setup_token: Option<String>,

    /// Already claimed access URL
    #[arg(long, env = "FINSYNC_SIMPLEFIN_ACCESS_URL", hide_env_values = true)]
    access_url: Option<String>,

    /// Enqueue a first sync right away
    #[arg(long)]
    sync: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum RangeArg {
    CurrentMonth,
    LastMonth,
    #[value(name = "last-3-months")]
    Last3Months,
    CurrentYear,
    LastYear,
    Custom,
}

#[derive(Clone, Copy, ValueEnum)]
enum AnalysisTypeArg {
    Spending,
    Trends,
    Insights,
    Budgets,
}

impl From<AnalysisTypeArg> for AnalysisType {
    fn from(arg: AnalysisTypeArg) -> Self {
        match arg {
            AnalysisTypeArg::Spending => AnalysisType::Spending,
            AnalysisTypeArg::Trends => AnalysisType::Trends,
            AnalysisTypeArg::Insights => AnalysisType::Insights,
            AnalysisTypeArg::Budgets => AnalysisType::Budgets,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TaskArg {
    Purge,
    Rescue,
}

impl From<TaskArg> for MaintenanceTask {
    fn from(arg: TaskArg) -> Self {
        match arg {
            TaskArg::Purge => MaintenanceTask::PurgeFinalizedJobs,
            TaskArg::Rescue => MaintenanceTask::RescueStuckJobs,
        }
    }
}

fn range_preset(
    range: RangeArg,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<RangePreset> {
    let preset = match range {
        RangeArg::Custom => match (start, end) {
            (Some(start), Some(end)) => RangePreset::Custom { start, end },
            _ => bail!("--range custom needs --start and --end"),
        },
        _ if start.is_some() || end.is_some() => {
            bail!("--start/--end only apply to --range custom")
        }
        RangeArg::CurrentMonth => RangePreset::CurrentMonth,
        RangeArg::LastMonth => RangePreset::LastMonth,
        RangeArg::Last3Months => RangePreset::Last3Months,
        RangeArg::CurrentYear => RangePreset::CurrentYear,
        RangeArg::LastYear => RangePreset::LastYear,
    };
    Ok(preset)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Keygen { key_version } = cli.command {
        let key = VaultKey::generate(key_version);
        println!("FINSYNC_VAULT_KEY_VERSION={key_version}");
        println!("FINSYNC_VAULT_KEY={}", key.to_base64());
        return Ok(());
    }

    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    telemetry::init(&config.logging, cli.verbose);
    let app = App::from_config(config)?;

    match cli.command {
        Commands::Worker { queues } => run_worker(&app, &queues).await,
        Commands::Enqueue(cmd) => enqueue(&app, cmd).await,
        Commands::Jobs(cmd) => jobs(&app, cmd).await,
        Commands::Stats => {
            for stats in app.service.queue_stats().await? {
                let c = &stats.counts;
                println!(
                    "{:<12} available={} running={} retryable={} completed={} discarded={} cancelled={}",
                    c.queue, c.available, c.running, c.retryable, c.completed, c.discarded, c.cancelled
                );
            }
            Ok(())
        }
        Commands::Health => {
            let report = app.service.health().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.healthy {
                bail!("unhealthy");
            }
            Ok(())
        }
        Commands::Connection(cmd) => connection(&app, cmd).await,
        Commands::Keygen { .. } => Ok(()),
    }
}

async fn run_worker(app: &App, queues: &[String]) -> Result<()> {
    let pool = app.worker_pool(queues)?;
    app.service.attach_pool(pool.status());
    let group = pool.start();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown requested");

    let report = group.shutdown(app.config.worker.shutdown_grace()).await;
    if report.graceful {
        info!("worker stopped cleanly");
    } else {
        warn!(
            interrupted = report.interrupted,
            aborted = report.aborted,
            "worker stopped after interrupting jobs"
        );
    }
    Ok(())
}

fn print_receipt(receipt: &EnqueueReceipt) -> Result<()> {
    match receipt {
        EnqueueReceipt::Enqueued {
            job_id,
            state,
            deduplicated: true,
        } => println!("{job_id} already in flight ({state})"),
        EnqueueReceipt::Enqueued { job_id, state, .. } => println!("{job_id} {state}"),
        EnqueueReceipt::Skipped { reason } => println!("skipped: {reason}"),
    }
    Ok(())
}

async fn enqueue(app: &App, cmd: EnqueueCommand) -> Result<()> {
    let receipt = match cmd {
        EnqueueCommand::Sync {
            org,
            connection,
            account,
            start,
            end,
        } => {
            let mut args = SyncArgs::new(org, connection);
            if let (Some(start), Some(end)) = (start, end) {
                let range = DateRange::new(start, end).map_err(anyhow::Error::msg)?;
                args = args.with_range(range);
            }
            if let Some(account) = account {
                args = args.with_account(account);
            }
            app.service.enqueue_sync(args).await?
        }
        EnqueueCommand::Analysis {
            org,
            range,
            start,
            end,
            analysis_type,
            notify,
            skip_if_unchanged,
        } => {
            let mut args = AnalysisArgs::new(org);
            args.range = range_preset(range, start, end)?;
            args.analysis_type = analysis_type.into();
            args.skip_if_unchanged = skip_if_unchanged;
            if notify {
                args.notify_channels.push(NotifyChannel::Ntfy);
            }
            app.service.enqueue_analysis(args).await?
        }
        EnqueueCommand::Maintenance { task, dry_run } => {
            let mut args = MaintenanceArgs::new(task.into());
            args.dry_run = dry_run;
            app.service.enqueue_maintenance(args).await?
        }
    };
    print_receipt(&receipt)
}

fn job_line(job: &JobRecord) -> String {
    let error = job
        .last_error
        .as_ref()
        .map(|e| format!("  [{:?}] {}", e.class, e.message))
        .unwrap_or_default();
    format!(
        "{}  {:<11} {:<11} {:<9} {}/{}  {}{}",
        job.id,
        job.queue,
        job.kind.as_str(),
        job.state.as_str(),
        job.attempt,
        job.max_attempts,
        job.scheduled_at.format("%Y-%m-%d %H:%M:%S"),
        error
    )
}

async fn jobs(app: &App, cmd: JobsCommand) -> Result<()> {
    match cmd {
        JobsCommand::List {
            queue,
            state,
            kind,
            limit,
        } => {
            let filter = JobFilter {
                queue,
                state,
                kind,
                limit: Some(limit),
            };
            for job in app.service.list_jobs(&filter).await? {
                println!("{}", job_line(&job));
            }
        }
        JobsCommand::Get { id } => {
            let job = app.service.get_job(id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        JobsCommand::Cancel { id } => match app.service.cancel_job(id).await? {
            CancelOutcome::Cancelled(job) => println!("{} cancelled", job.id),
            CancelOutcome::Requested(job) => {
                println!("{} is running; cancellation requested", job.id)
            }
            CancelOutcome::AlreadyFinal(job) => {
                println!("{} already finished ({})", job.id, job.state)
            }
        },
    }
    Ok(())
}

async fn connection(app: &App, cmd: ConnectionCommand) -> Result<()> {
    match cmd {
        ConnectionCommand::Add(add) => {
            let vault = app.vault()?;
            let credentials = match (add.setup_token, add.access_url) {
                (Some(token), _) => {
                    SimpleFinClient::from_config(&app.config.providers)
                        .claim_access_url(&token)
                        .await
                        .context("claiming SimpleFIN setup token")?
                }
                (None, Some(url)) => Credentials::new().with(ACCESS_URL_FIELD, url),
                (None, None) => bail!("either --setup-token or --access-url is required"),
            };

            let id = UlidGenerator::new(SystemClock).connection_id();
            let sealed = vault
                .seal(&credentials, &credentials_aad(id))
                .context("sealing credentials")?;
            drop(credentials);

            let connection = Connection {
                id,
                organization_id: add.org,
                provider_type: PROVIDER_TYPE.to_string(),
                name: add.name,
                credentials: sealed,
                status: ConnectionStatus::Active,
                status_message: None,
                last_synced_at: None,
                created_at: Utc::now(),
            };
            app.backend.connections.insert_connection(&connection).await?;
            println!("{id}");

            if add.sync {
                let receipt = app
                    .service
                    .enqueue_sync(SyncArgs::new(connection.organization_id, id))
                    .await?;
                print_receipt(&receipt)?;
            }
        }
        ConnectionCommand::Show { id } => {
            let conn = app
                .backend
                .connections
                .get_connection(id)
                .await?
                .with_context(|| format!("connection {id} not found"))?;
            println!("id:           {}", conn.id);
            println!("organization: {}", conn.organization_id);
            println!("provider:     {}", conn.provider_type);
            println!("name:         {}", conn.name);
            println!("status:       {}", conn.status);
            if let Some(message) = &conn.status_message {
                println!("message:      {message}");
            }
            match conn.last_synced_at {
                Some(at) => println!("last synced:  {}", at.to_rfc3339()),
                None => println!("last synced:  never"),
            }
            println!("key version:  {}", conn.credentials.key_version);
        }
        ConnectionCommand::Reseal { id } => {
            let vault = app.vault()?;
            let conn = app
                .backend
                .connections
                .get_connection(id)
                .await?
                .with_context(|| format!("connection {id} not found"))?;
            if !vault.needs_reseal(&conn.credentials) {
                println!("{id} already uses key version {}", vault.current_version());
                return Ok(());
            }
            let resealed = vault
                .reseal(&conn.credentials, &conn.credentials_aad())
                .context("resealing credentials")?;
            app.backend
                .connections
                .update_credentials(id, &resealed)
                .await?;
            println!(
                "{id} resealed: key version {} -> {}",
                conn.credentials.key_version, resealed.key_version
            );
        }
        ConnectionCommand::Test {
            id,
            sample_transactions,
        } => {
            let conn = app
                .backend
                .connections
                .get_connection(id)
                .await?
                .with_context(|| format!("connection {id} not found"))?;
            let receipt = app
                .service
                .enqueue_sync(SyncArgs::verify(conn.organization_id, id, sample_transactions))
                .await?;
            print_receipt(&receipt)?;
        }
    }
    Ok(())
}
