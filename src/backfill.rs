//! Backfill job orchestration
//!
//! A job splits its date range into chunks and, for each chunk, fetches the
//! readings, writes them idempotently and then saves a checkpoint. Each job
//! runs on its own task. At most one job per station is active at a time
//! because all jobs share the same vendor rate budget; the job table
//! enforces this across every process using the database.

use std::collections::HashMap;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::watch;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    config::BackfillConfig,
    database::{CheckpointManager, Database, JobStore, ReadingWriter},
    errors::BackfillError,
    fetcher::PageFetcher,
    models::{validate_range, BackfillJob, JobSnapshot, JobStatus, Reading, StationId},
};

static ORCHESTRATORS: AtomicU64 = AtomicU64::new(0);

struct JobHandle {
    stop: Arc<watch::Sender<bool>>,
    progress: watch::Receiver<JobSnapshot>,
}

impl JobHandle {
    fn status(&self) -> JobStatus {
        self.progress.borrow().job.status
    }
}

pub struct BackfillOrchestrator {
    fetcher: PageFetcher,
    writer: ReadingWriter,
    checkpoints: CheckpointManager,
    jobs: JobStore,
    settings: BackfillConfig,
    /// Identifies this orchestrator as the owner of the jobs it runs
    owner: String,
    registry: Mutex<HashMap<i64, JobHandle>>,
}

impl BackfillOrchestrator {
    pub fn new(
        fetcher: PageFetcher,
        database: &Database,
        settings: BackfillConfig,
    ) -> Result<Self, BackfillError> {
        settings.validate()?;
        let owner = format!(
            "{}-{}-{}",
            process::id(),
            Utc::now().timestamp_millis(),
            ORCHESTRATORS.fetch_add(1, Ordering::Relaxed)
        );
        debug!("Backfill orchestrator {} ready", owner);

        Ok(Self {
            fetcher,
            writer: database.readings(),
            checkpoints: database.checkpoints(),
            jobs: database.jobs(),
            settings,
            owner,
            registry: Mutex::new(HashMap::new()),
        })
    }

    /// Validate and launch a backfill of `[start_date, end_date]` (inclusive).
    ///
    /// Rejected with [`BackfillError::JobAlreadyRunning`] while any process
    /// has a live pending or running job for the station.
    pub async fn start(
        &self,
        station: &StationId,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<i64, BackfillError> {
        validate_range(start_date, end_date, self.settings.max_range_days)?;
        self.recover_abandoned().await?;

        let job = self
            .jobs
            .create(station, start_date, end_date, &self.owner)
            .await?;
        let id = job.id;
        self.launch(job);
        Ok(id)
    }

    /// Ask a pending or running job to pause at the next safe point.
    ///
    /// Jobs run by another process receive the request with their next
    /// heartbeat.
    pub async fn stop(&self, id: i64) -> Result<(), BackfillError> {
        let signalled = self.registry().get(&id).is_some_and(|handle| {
            let active = handle.status().is_active();
            if active {
                handle.stop.send_replace(true);
            }
            active
        });

        if !signalled {
            self.recover_abandoned().await?;
            if !self.jobs.request_stop(id).await? {
                let job = self.jobs.get(id).await?;
                return Err(BackfillError::InvalidTransition {
                    id,
                    action: "stop",
                    status: job.status.to_string(),
                });
            }
        }

        info!("Stop requested for backfill job {}", id);
        Ok(())
    }

    /// Continue a paused job from its last checkpoint.
    pub async fn resume(&self, id: i64) -> Result<(), BackfillError> {
        self.recover_abandoned().await?;
        let job = self.jobs.claim(id, &self.owner).await?;

        info!("Resuming backfill job {}", id);
        self.launch(job);
        Ok(())
    }

    /// Operator reset of a failed job back to paused; the checkpoint is kept.
    pub async fn reset(&self, id: i64) -> Result<BackfillJob, BackfillError> {
        let job = self.jobs.reset(id).await?;
        self.registry().remove(&id);
        Ok(job)
    }

    /// Latest progress of a job started by this orchestrator.
    ///
    /// Never waits on the job's task. A settled job is reported once and then
    /// forgotten; read it afterwards with [`BackfillOrchestrator::job`].
    pub fn status(&self, id: i64) -> Option<JobSnapshot> {
        let mut registry = self.registry();
        let snapshot = registry.get(&id)?.progress.borrow().clone();
        if !snapshot.job.status.is_active() {
            registry.remove(&id);
        }
        Some(snapshot)
    }

    /// Persisted job record
    pub async fn job(&self, id: i64) -> Result<BackfillJob, BackfillError> {
        self.jobs.get(id).await
    }

    /// All persisted jobs, newest first
    pub async fn jobs(&self) -> Result<Vec<BackfillJob>, BackfillError> {
        self.jobs.list().await
    }

    /// Wait until the job is no longer pending or running.
    pub async fn wait(&self, id: i64) -> Result<JobSnapshot, BackfillError> {
        let progress = self
            .registry()
            .get(&id)
            .map(|handle| handle.progress.clone());

        let Some(mut progress) = progress else {
            return Ok(self.jobs.get(id).await?.into());
        };

        let settled = progress
            .wait_for(|s| !s.job.status.is_active())
            .await
            .map(|s| JobSnapshot::clone(&s));
        let snapshot = match settled {
            Ok(snapshot) => snapshot,
            Err(_) => progress.borrow().clone(),
        };

        // A resume may already have replaced the handle
        let mut registry = self.registry();
        if registry
            .get(&id)
            .is_some_and(|handle| handle.progress.same_channel(&progress))
        {
            registry.remove(&id);
        }
        Ok(snapshot)
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<i64, JobHandle>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pause jobs whose owning process stopped sending heartbeats
    async fn recover_abandoned(&self) -> Result<u64, BackfillError> {
        self.jobs
            .pause_stale(self.settings.stale_after, &self.owner)
            .await
    }

    fn launch(&self, job: BackfillJob) {
        let id = job.id;
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let (progress_tx, progress_rx) = watch::channel(JobSnapshot::from(job.clone()));

        self.registry().insert(
            id,
            JobHandle {
                stop: Arc::clone(&stop_tx),
                progress: progress_rx,
            },
        );

        let runner = JobRunner {
            fetcher: self.fetcher.clone(),
            writer: self.writer.clone(),
            checkpoints: self.checkpoints.clone(),
            jobs: self.jobs.clone(),
            settings: self.settings.clone(),
            owner: self.owner.clone(),
            job,
            eta: None,
            stop: stop_rx,
            stop_tx,
            progress: progress_tx,
        };
        tokio::spawn(runner.run());
    }
}

/// Resolves once `stop` carries `true`; never resolves if the sender is gone
pub(crate) async fn stop_signal(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Background worker for one job
struct JobRunner {
    fetcher: PageFetcher,
    writer: ReadingWriter,
    checkpoints: CheckpointManager,
    jobs: JobStore,
    settings: BackfillConfig,
    owner: String,
    job: BackfillJob,
    eta: Option<Duration>,
    stop: watch::Receiver<bool>,
    /// Lets heartbeats relay stop requests made by other processes
    stop_tx: Arc<watch::Sender<bool>>,
    progress: watch::Sender<JobSnapshot>,
}

impl JobRunner {
    async fn run(mut self) {
        let id = self.job.id;
        match self.drive_with_heartbeat().await {
            Ok(status) => {
                self.job.status = status;
                info!(
                    "Backfill job {} {}: {} records inserted, {} requests",
                    id, status, self.job.records_inserted, self.job.requests_made
                );
            }
            Err(e) => {
                error!("Backfill job {} failed: {}", id, e);
                self.job.status = JobStatus::Failed;
                self.job.error_message = Some(e.to_string());
            }
        }

        self.eta = None;
        match self.jobs.update(&self.job, &self.owner).await {
            Ok(true) => {}
            Ok(false) => warn!("Backfill job {} is owned elsewhere, final state not saved", id),
            Err(e) => error!("Failed to persist final state of job {}: {}", id, e),
        }
        self.publish();
    }

    /// Drive the job while refreshing its heartbeat in the background
    async fn drive_with_heartbeat(&mut self) -> Result<JobStatus, BackfillError> {
        let id = self.job.id;
        let jobs = self.jobs.clone();
        let owner = self.owner.clone();
        let stop_tx = Arc::clone(&self.stop_tx);
        let every = (self.settings.stale_after / 4).max(Duration::from_millis(1));
        let mut heartbeat = interval(every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let drive = self.drive();
        tokio::pin!(drive);

        loop {
            tokio::select! {
                outcome = &mut drive => return outcome,
                _ = heartbeat.tick() => match jobs.heartbeat(id, &owner).await {
                    Ok(true) => {
                        if !*stop_tx.borrow() {
                            info!("Backfill job {} asked to stop from outside", id);
                        }
                        stop_tx.send_replace(true);
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Heartbeat for backfill job {} failed: {}", id, e),
                },
            }
        }
    }

    async fn drive(&mut self) -> Result<JobStatus, BackfillError> {
        let id = self.job.id;
        self.job.status = JobStatus::Running;
        self.job.error_message = None;
        if !self.persist().await? {
            return Ok(JobStatus::Paused);
        }
        self.publish();

        let end = self.job.end_ms();
        let checkpoint = self.checkpoints.load(id).await?;
        self.job.cursor = checkpoint;
        let mut cursor = checkpoint.unwrap_or_else(|| self.job.start_ms());
        info!(
            "Backfill job {} running for {} from {} to {}",
            id,
            self.job.station_id,
            format_ms(cursor),
            format_ms(end)
        );

        let chunk_ms = (self.settings.chunk_size.as_millis() as i64).max(1);
        let mut chunk_time = Duration::ZERO;
        let mut chunks_done = 0u32;

        while cursor < end {
            if *self.stop.borrow() {
                return Ok(JobStatus::Paused);
            }

            let chunk_end = cursor.saturating_add(chunk_ms).min(end);
            let started = Instant::now();

            let Some(readings) = self.fetch_chunk(cursor, chunk_end).await? else {
                return Ok(JobStatus::Paused);
            };

            // Write and checkpoint are never interrupted by a stop request
            let inserted = self.writer.upsert(&self.job.station_id, &readings).await?;
            self.checkpoints.save(id, chunk_end).await?;

            cursor = chunk_end;
            self.job.cursor = Some(cursor);
            self.job.records_inserted += inserted;

            chunk_time += started.elapsed();
            chunks_done += 1;
            let remaining = (end - cursor + chunk_ms - 1) / chunk_ms;
            let remaining_chunks = u32::try_from(remaining).unwrap_or(u32::MAX);
            self.eta = Some((chunk_time / chunks_done).saturating_mul(remaining_chunks));

            if !self.persist().await? {
                return Ok(JobStatus::Paused);
            }
            self.publish();
            info!(
                "Backfill job {}: chunk up to {} done, {} new of {} fetched, {} chunks left",
                id,
                format_ms(cursor),
                inserted,
                readings.len(),
                remaining
            );
        }

        Ok(JobStatus::Completed)
    }

    /// Save progress; `false` once another owner has taken the job over.
    async fn persist(&self) -> Result<bool, BackfillError> {
        let owned = self.jobs.update(&self.job, &self.owner).await?;
        if !owned {
            warn!(
                "Backfill job {} was taken over by another process, pausing",
                self.job.id
            );
        }
        Ok(owned)
    }

    /// Fetch `[start, end)`, retrying transient failures after a cooldown.
    ///
    /// `None` means a stop was requested before the chunk was fetched.
    async fn fetch_chunk(
        &mut self,
        start: i64,
        end: i64,
    ) -> Result<Option<Vec<Reading>>, BackfillError> {
        let mut failures = 0u32;

        loop {
            let mut pages = self.fetcher.fetch_range(&self.job.station_id, start, end - 1);
            let result = tokio::select! {
                biased;
                _ = stop_signal(&mut self.stop) => None,
                result = pages.collect_all() => Some(result),
            };
            self.job.requests_made += pages.requests_made();

            let Some(result) = result else {
                debug!("Stop requested while fetching chunk at {}", format_ms(start));
                return Ok(None);
            };

            match result {
                Ok(readings) => return Ok(Some(readings)),
                Err(e) if e.is_transient() && failures < self.settings.max_chunk_retries => {
                    failures += 1;
                    let cooldown = self.fetcher.client().cooldown();
                    warn!(
                        "Chunk at {} failed ({}), retry {}/{} in {:?}",
                        format_ms(start),
                        e,
                        failures,
                        self.settings.max_chunk_retries,
                        cooldown
                    );
                    self.publish();

                    tokio::select! {
                        biased;
                        _ = stop_signal(&mut self.stop) => return Ok(None),
                        _ = sleep(cooldown) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn publish(&self) {
        self.progress.send_replace(JobSnapshot {
            job: self.job.clone(),
            estimated_time_remaining: self.eta,
        });
    }
}

fn format_ms(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}
