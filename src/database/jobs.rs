// src/database/jobs.rs
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::{
    database::models::JobRow,
    errors::BackfillError,
    models::{BackfillJob, JobStatus, StationId},
};

const JOB_COLUMNS: &str = "id, station_id, start_date, end_date, status, cursor_ms, \
    requests_made, records_inserted, error_message";

/// Persistence for backfill job records
///
/// An active (pending or running) job is owned by the orchestrator that
/// launched it, identified by an opaque owner string, and kept alive by
/// heartbeats. The schema allows one active job per station, so admission
/// holds across processes sharing the database.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new pending job owned by `owner`.
    ///
    /// Fails with [`BackfillError::JobAlreadyRunning`] while another job for
    /// the station is pending or running.
    pub async fn create(
        &self,
        station: &StationId,
        start_date: NaiveDate,
        end_date: NaiveDate,
        owner: &str,
    ) -> Result<BackfillJob, BackfillError> {
        let now = Utc::now().timestamp_millis();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO backfill_jobs
                (station_id, start_date, end_date, status, owner, heartbeat_at,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(station.as_str())
        .bind(start_date)
        .bind(end_date)
        .bind(JobStatus::Pending)
        .bind(owner)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| admission_error(e, station))?;

        info!(
            "Created backfill job {} for {} ({} to {})",
            id, station, start_date, end_date
        );

        Ok(BackfillJob {
            id,
            station_id: station.clone(),
            start_date,
            end_date,
            status: JobStatus::Pending,
            cursor: None,
            requests_made: 0,
            records_inserted: 0,
            error_message: None,
        })
    }

    pub async fn get(&self, id: i64) -> Result<BackfillJob, BackfillError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM backfill_jobs WHERE id = ?",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(BackfillError::JobNotFound(id))?;
        row.try_into()
    }

    /// All jobs, newest first
    pub async fn list(&self) -> Result<Vec<BackfillJob>, BackfillError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM backfill_jobs ORDER BY id DESC",
            JOB_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BackfillJob::try_from).collect()
    }

    /// Persist status, counters, cursor and error of `job` while `owner`
    /// still owns it. Also counts as a heartbeat.
    ///
    /// Returns `false` when the job has been taken over by someone else.
    pub async fn update(&self, job: &BackfillJob, owner: &str) -> Result<bool, BackfillError> {
        let now = Utc::now().timestamp_millis();
        let updated = sqlx::query(
            "UPDATE backfill_jobs SET
                status = ?, cursor_ms = ?, requests_made = ?, records_inserted = ?,
                error_message = ?, heartbeat_at = ?, updated_at = ?
             WHERE id = ? AND owner = ?",
        )
        .bind(job.status)
        .bind(job.cursor)
        .bind(job.requests_made as i64)
        .bind(job.records_inserted as i64)
        .bind(job.error_message.as_deref())
        .bind(now)
        .bind(now)
        .bind(job.id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| admission_error(e, &job.station_id))?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Take over a paused job for `owner`, moving it to pending.
    pub async fn claim(&self, id: i64, owner: &str) -> Result<BackfillJob, BackfillError> {
        let job = self.get(id).await?;
        if job.status != JobStatus::Paused {
            return Err(invalid_transition(&job, "resume"));
        }

        let now = Utc::now().timestamp_millis();
        let claimed = sqlx::query(
            "UPDATE backfill_jobs SET
                status = ?, owner = ?, heartbeat_at = ?, stop_requested = 0, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(JobStatus::Pending)
        .bind(owner)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(JobStatus::Paused)
        .execute(&self.pool)
        .await
        .map_err(|e| admission_error(e, &job.station_id))?
        .rows_affected();

        if claimed == 0 {
            // Someone else moved it between the read and the update
            return Err(invalid_transition(&self.get(id).await?, "resume"));
        }
        Ok(BackfillJob {
            status: JobStatus::Pending,
            ..job
        })
    }

    /// Operator reset of a failed job back to paused; the checkpoint is kept.
    pub async fn reset(&self, id: i64) -> Result<BackfillJob, BackfillError> {
        let reset = sqlx::query(
            "UPDATE backfill_jobs SET status = ?, error_message = NULL, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(JobStatus::Paused)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .bind(JobStatus::Failed)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let job = self.get(id).await?;
        if reset == 0 {
            return Err(invalid_transition(&job, "reset"));
        }
        info!("Backfill job {} reset to paused", id);
        Ok(job)
    }

    /// Refresh the heartbeat of a job owned by `owner`.
    ///
    /// Returns `true` when the job should stop: a stop was requested or the
    /// job is no longer owned by `owner`.
    pub async fn heartbeat(&self, id: i64, owner: &str) -> Result<bool, BackfillError> {
        let stop_requested: Option<bool> = sqlx::query_scalar(
            "UPDATE backfill_jobs SET heartbeat_at = ?
             WHERE id = ? AND owner = ? AND status IN (?, ?)
             RETURNING stop_requested",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .bind(owner)
        .bind(JobStatus::Pending)
        .bind(JobStatus::Running)
        .fetch_optional(&self.pool)
        .await?;
        Ok(stop_requested.unwrap_or(true))
    }

    /// Flag an active job to pause; its owner picks this up on the next
    /// heartbeat. Returns `false` if the job is not active.
    pub async fn request_stop(&self, id: i64) -> Result<bool, BackfillError> {
        let flagged = sqlx::query(
            "UPDATE backfill_jobs SET stop_requested = 1, updated_at = ?
             WHERE id = ? AND status IN (?, ?)",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .bind(JobStatus::Pending)
        .bind(JobStatus::Running)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(flagged > 0)
    }

    /// Pause active jobs whose owner has not sent a heartbeat within
    /// `stale_after`, leaving jobs of `except_owner` alone. The previous owner
    /// loses the job, so its late writes are ignored.
    ///
    /// Returns the number of jobs recovered.
    pub async fn pause_stale(
        &self,
        stale_after: Duration,
        except_owner: &str,
    ) -> Result<u64, BackfillError> {
        let now = Utc::now().timestamp_millis();
        let cutoff = now.saturating_sub(stale_after.as_millis() as i64);
        let recovered = sqlx::query(
            "UPDATE backfill_jobs SET status = ?, owner = NULL, updated_at = ?
             WHERE status IN (?, ?)
               AND (heartbeat_at IS NULL OR heartbeat_at <= ?)
               AND (owner IS NULL OR owner <> ?)",
        )
        .bind(JobStatus::Paused)
        .bind(now)
        .bind(JobStatus::Pending)
        .bind(JobStatus::Running)
        .bind(cutoff)
        .bind(except_owner)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if recovered > 0 {
            warn!(
                "Marked {} backfill jobs without a live owner as paused",
                recovered
            );
        }
        Ok(recovered)
    }
}

fn invalid_transition(job: &BackfillJob, action: &'static str) -> BackfillError {
    BackfillError::InvalidTransition {
        id: job.id,
        action,
        status: job.status.to_string(),
    }
}

/// Second active job for a station trips the partial unique index
fn admission_error(e: sqlx::Error, station: &StationId) -> BackfillError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            warn!(
                "Rejected backfill request: job already running for {}",
                station
            );
            BackfillError::JobAlreadyRunning(station.to_string())
        }
        _ => BackfillError::Storage(e),
    }
}
