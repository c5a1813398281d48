// src/database/models.rs
use chrono::NaiveDate;

use crate::{
    errors::BackfillError,
    models::{BackfillJob, JobStatus, StationId},
};

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub station_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: JobStatus,
    pub cursor_ms: Option<i64>,
    pub requests_made: i64,
    pub records_inserted: i64,
    pub error_message: Option<String>,
}

impl TryFrom<JobRow> for BackfillJob {
    type Error = BackfillError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(BackfillJob {
            id: row.id,
            station_id: StationId::try_from(row.station_id)?,
            start_date: row.start_date,
            end_date: row.end_date,
            status: row.status,
            cursor: row.cursor_ms,
            requests_made: row.requests_made.max(0) as u64,
            records_inserted: row.records_inserted.max(0) as u64,
            error_message: row.error_message,
        })
    }
}
