//! Weather backfill utility

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use weather_backfill::{
    backfill::BackfillOrchestrator,
    client::RateLimitedHttpClient,
    config::{AppConfig, VendorConfig},
    database::Database,
    errors::BackfillError,
    fetcher::PageFetcher,
    models::{JobSnapshot, JobStatus, StationId},
    poller::LatestPoller,
};

/// How often a running job's progress is logged
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(version, about = "Ambient Weather history backfill")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Backfill a date range, both dates inclusive (UTC)
    Backfill {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        /// Station MAC address, defaults to the configured one
        #[arg(long)]
        station: Option<String>,
    },
    /// Resume a paused job from its last checkpoint
    Resume { job_id: i64 },
    /// Move a failed job back to paused so it can be resumed
    Reset { job_id: i64 },
    /// Ask a running job, possibly in another process, to pause
    Stop { job_id: i64 },
    /// List backfill jobs
    Jobs,
    /// Store the latest reading periodically until interrupted
    Poll,
}

#[tokio::main]
async fn main() -> Result<ExitCode, BackfillError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load()?;
    let db = Database::open(&config.database).await?;

    let outcome = match cli.cmd {
        Cmd::Backfill {
            start,
            end,
            station,
        } => {
            let station = StationId::try_from(
                station
                    .as_deref()
                    .unwrap_or(config.vendor.mac_address.as_str()),
            )?;
            let orchestrator = orchestrator(&config, &db)?;
            let id = orchestrator.start(&station, start, end).await?;
            supervise(&orchestrator, id).await?
        }
        Cmd::Resume { job_id } => {
            let orchestrator = orchestrator(&config, &db)?;
            orchestrator.resume(job_id).await?;
            supervise(&orchestrator, job_id).await?
        }
        Cmd::Reset { job_id } => {
            let job = db.jobs().reset(job_id).await?;
            println!("Job {} is {}", job.id, job.status);
            ExitCode::SUCCESS
        }
        Cmd::Stop { job_id } => {
            if db.jobs().request_stop(job_id).await? {
                println!("Job {} will pause at the next safe point", job_id);
                ExitCode::SUCCESS
            } else {
                let job = db.jobs().get(job_id).await?;
                println!("Job {} is {}, nothing to stop", job.id, job.status);
                ExitCode::FAILURE
            }
        }
        Cmd::Jobs => {
            for job in db.jobs().list().await? {
                println!(
                    "{:>5}  {}  {} .. {}  {:<9}  requests={}  inserted={}  {}",
                    job.id,
                    job.station_id,
                    job.start_date,
                    job.end_date,
                    job.status,
                    job.requests_made,
                    job.records_inserted,
                    job.error_message.unwrap_or_default()
                );
            }
            ExitCode::SUCCESS
        }
        Cmd::Poll => {
            config.poller.validate()?;
            let station = StationId::try_from(config.vendor.mac_address.as_str())?;
            let poller = LatestPoller::new(
                fetcher(&config.vendor)?,
                db.readings(),
                station,
                config.poller.interval,
            );
            let (stop_tx, stop_rx) = watch::channel(false);
            let mut task = tokio::spawn(async move { poller.run(stop_rx).await });

            let finished = tokio::select! {
                finished = &mut task => finished,
                _ = signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    stop_tx.send_replace(true);
                    task.await
                }
            };
            if let Err(e) = finished {
                error!("Poller task ended abnormally: {}", e);
            }
            ExitCode::SUCCESS
        }
    };

    db.close().await;
    Ok(outcome)
}

/// Vendor client and pager; only commands that call the vendor need its keys
fn fetcher(vendor: &VendorConfig) -> Result<PageFetcher, BackfillError> {
    vendor.validate()?;
    let client = Arc::new(RateLimitedHttpClient::from_config(vendor)?);
    Ok(PageFetcher::new(client, vendor.page_limit))
}

fn orchestrator(config: &AppConfig, db: &Database) -> Result<BackfillOrchestrator, BackfillError> {
    BackfillOrchestrator::new(fetcher(&config.vendor)?, db, config.backfill.clone())
}

/// Log progress until the job settles; Ctrl-C pauses it after the current chunk.
async fn supervise(
    orchestrator: &BackfillOrchestrator,
    id: i64,
) -> Result<ExitCode, BackfillError> {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    let settled = orchestrator.wait(id);
    tokio::pin!(settled);
    let mut interrupted = false;

    loop {
        tokio::select! {
            snapshot = &mut settled => {
                let snapshot = snapshot?;
                report(&snapshot);
                return Ok(match snapshot.job.status {
                    JobStatus::Failed => ExitCode::FAILURE,
                    _ => ExitCode::SUCCESS,
                });
            }
            _ = signal::ctrl_c(), if !interrupted => {
                info!("Received shutdown signal, pausing job {} at the next safe point", id);
                interrupted = true;
                if let Err(e) = orchestrator.stop(id).await {
                    warn!("Could not stop job {}: {}", id, e);
                }
            }
            _ = ticker.tick() => {
                if let Some(snapshot) = orchestrator.status(id) {
                    report(&snapshot);
                }
            }
        }
    }
}

fn report(snapshot: &JobSnapshot) {
    let job = &snapshot.job;
    match job.status {
        JobStatus::Failed => error!(
            "Job {} failed: {}",
            job.id,
            job.error_message.as_deref().unwrap_or("unknown error")
        ),
        status => info!(
            "Job {} {}: cursor={:?} requests={} inserted={} eta={:?}",
            job.id,
            status,
            job.cursor,
            job.requests_made,
            job.records_inserted,
            snapshot.estimated_time_remaining
        ),
    }
}
