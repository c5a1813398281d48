// src/database/readings.rs
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::{
    errors::BackfillError,
    models::{Reading, StationId},
};

/// Rows per INSERT statement, keeps bound parameters under SQLite's limit
const ROWS_PER_STATEMENT: usize = 500;

const READING_COLUMNS: &str = "timestamp, temp_f, temp_in_f, humidity, humidity_in, \
    feels_like_f, dew_point_f, barom_rel_in, barom_abs_in, wind_dir, wind_speed_mph, \
    wind_gust_mph, max_daily_gust_mph, wind_dir_avg10m, wind_speed_avg10m_mph, \
    hourly_rain_in, event_rain_in, daily_rain_in, weekly_rain_in, monthly_rain_in, \
    yearly_rain_in, total_rain_in, solar_radiation, uv";

/// Idempotent writer for station readings
///
/// Rows are keyed by `(station_id, timestamp)`. Inserting a reading that is
/// already stored is a no-op: observed data is never overwritten.
#[derive(Clone)]
pub struct ReadingWriter {
    pool: SqlitePool,
}

impl ReadingWriter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert readings not yet stored, returning how many rows were added.
    ///
    /// The whole batch commits in one transaction.
    pub async fn upsert(
        &self,
        station: &StationId,
        readings: &[Reading],
    ) -> Result<u64, BackfillError> {
        if readings.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for batch in readings.chunks(ROWS_PER_STATEMENT) {
            let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "INSERT INTO readings (station_id, {}) ",
                READING_COLUMNS
            ));
            query.push_values(batch, |mut row, r| {
                row.push_bind(station.as_str())
                    .push_bind(r.timestamp)
                    .push_bind(r.temp_f)
                    .push_bind(r.temp_in_f)
                    .push_bind(r.humidity)
                    .push_bind(r.humidity_in)
                    .push_bind(r.feels_like_f)
                    .push_bind(r.dew_point_f)
                    .push_bind(r.barom_rel_in)
                    .push_bind(r.barom_abs_in)
                    .push_bind(r.wind_dir)
                    .push_bind(r.wind_speed_mph)
                    .push_bind(r.wind_gust_mph)
                    .push_bind(r.max_daily_gust_mph)
                    .push_bind(r.wind_dir_avg10m)
                    .push_bind(r.wind_speed_avg10m_mph)
                    .push_bind(r.hourly_rain_in)
                    .push_bind(r.event_rain_in)
                    .push_bind(r.daily_rain_in)
                    .push_bind(r.weekly_rain_in)
                    .push_bind(r.monthly_rain_in)
                    .push_bind(r.yearly_rain_in)
                    .push_bind(r.total_rain_in)
                    .push_bind(r.solar_radiation)
                    .push_bind(r.uv);
            });
            query.push(" ON CONFLICT (station_id, timestamp) DO NOTHING");

            inserted += query.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        debug!(
            "Stored {} of {} readings for {}",
            inserted,
            readings.len(),
            station
        );
        Ok(inserted)
    }

    /// Number of stored readings for a station
    pub async fn count(&self, station: &StationId) -> Result<i64, BackfillError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM readings WHERE station_id = ?")
            .bind(station.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Most recent stored reading for a station
    pub async fn latest(&self, station: &StationId) -> Result<Option<Reading>, BackfillError> {
        let reading = sqlx::query_as::<_, Reading>(&format!(
            "SELECT {} FROM readings WHERE station_id = ? ORDER BY timestamp DESC LIMIT 1",
            READING_COLUMNS
        ))
        .bind(station.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(reading)
    }

    /// Stored readings in `[start_ms, end_ms)`, oldest first
    pub async fn between(
        &self,
        station: &StationId,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Reading>, BackfillError> {
        let readings = sqlx::query_as::<_, Reading>(&format!(
            "SELECT {} FROM readings
             WHERE station_id = ? AND timestamp >= ? AND timestamp < ?
             ORDER BY timestamp",
            READING_COLUMNS
        ))
        .bind(station.as_str())
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(readings)
    }
}
