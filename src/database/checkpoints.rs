// src/database/checkpoints.rs
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::errors::BackfillError;

/// Durable resume points for backfill jobs
///
/// A checkpoint is only saved after the chunk it covers has been committed,
/// so a crash can cause a chunk to be fetched again but never skipped.
#[derive(Clone)]
pub struct CheckpointManager {
    pool: SqlitePool,
}

impl CheckpointManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record `cursor` (epoch milliseconds) as the job's completed boundary.
    ///
    /// Returns once the write is committed.
    pub async fn save(&self, job_id: i64, cursor: i64) -> Result<(), BackfillError> {
        sqlx::query(
            "INSERT INTO backfill_checkpoints (job_id, cursor_ms, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT (job_id) DO UPDATE SET
                cursor_ms = excluded.cursor_ms,
                updated_at = excluded.updated_at",
        )
        .bind(job_id)
        .bind(cursor)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!("Checkpoint for job {} at {}", job_id, cursor);
        Ok(())
    }

    /// Last saved boundary, `None` for a job that never completed a chunk
    pub async fn load(&self, job_id: i64) -> Result<Option<i64>, BackfillError> {
        let cursor =
            sqlx::query_scalar("SELECT cursor_ms FROM backfill_checkpoints WHERE job_id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cursor)
    }
}
