//! Data models.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::BackfillError;

/// Weather station identifier
///
/// Ambient Weather addresses stations by the device MAC address, six
/// hex octets separated by colons. Stored upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StationId(String);

impl TryFrom<&str> for StationId {
    type Error = BackfillError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        let octets: Vec<&str> = trimmed.split(':').collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(BackfillError::InvalidStation(value.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }
}

impl TryFrom<String> for StationId {
    type Error = BackfillError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl FromStr for StationId {
    type Err = BackfillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s)
    }
}

impl From<StationId> for String {
    fn from(value: StationId) -> Self {
        value.0
    }
}

impl StationId {
    /// Get the MAC address
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One timestamped observation from a station
///
/// `timestamp` is the natural key: two readings with the same timestamp
/// from the same station are the same observation.
///
/// See: https://ambientweather.docs.apiary.io/#reference/ambient-weather-rest-api
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default, sqlx::FromRow)]
#[serde(default)]
pub struct Reading {
    /// Observation time in milliseconds from Unix epoch
    #[serde(rename = "dateutc")]
    pub timestamp: i64,
    /// Outdoor temperature, °F
    #[serde(rename = "tempf")]
    pub temp_f: Option<f64>,
    /// Indoor temperature, °F
    #[serde(rename = "tempinf")]
    pub temp_in_f: Option<f64>,
    /// Outdoor relative humidity, %
    pub humidity: Option<f64>,
    /// Indoor relative humidity, %
    #[serde(rename = "humidityin")]
    pub humidity_in: Option<f64>,
    #[serde(rename = "feelsLike")]
    pub feels_like_f: Option<f64>,
    #[serde(rename = "dewPoint")]
    pub dew_point_f: Option<f64>,
    /// Relative barometric pressure, inHg
    #[serde(rename = "baromrelin")]
    pub barom_rel_in: Option<f64>,
    /// Absolute barometric pressure, inHg
    #[serde(rename = "baromabsin")]
    pub barom_abs_in: Option<f64>,
    /// Instantaneous wind direction, degrees 0-360
    #[serde(rename = "winddir")]
    pub wind_dir: Option<f64>,
    #[serde(rename = "windspeedmph")]
    pub wind_speed_mph: Option<f64>,
    /// Max wind speed in the last 10 minutes, mph
    #[serde(rename = "windgustmph")]
    pub wind_gust_mph: Option<f64>,
    #[serde(rename = "maxdailygust")]
    pub max_daily_gust_mph: Option<f64>,
    #[serde(rename = "winddir_avg10m")]
    pub wind_dir_avg10m: Option<f64>,
    #[serde(rename = "windspdmph_avg10m")]
    pub wind_speed_avg10m_mph: Option<f64>,
    /// Hourly rain rate, in/hr
    #[serde(rename = "hourlyrainin")]
    pub hourly_rain_in: Option<f64>,
    #[serde(rename = "eventrainin")]
    pub event_rain_in: Option<f64>,
    #[serde(rename = "dailyrainin")]
    pub daily_rain_in: Option<f64>,
    #[serde(rename = "weeklyrainin")]
    pub weekly_rain_in: Option<f64>,
    #[serde(rename = "monthlyrainin")]
    pub monthly_rain_in: Option<f64>,
    #[serde(rename = "yearlyrainin")]
    pub yearly_rain_in: Option<f64>,
    #[serde(rename = "totalrainin")]
    pub total_rain_in: Option<f64>,
    /// Solar radiation, W/m^2
    #[serde(rename = "solarradiation")]
    pub solar_radiation: Option<f64>,
    /// UV index
    pub uv: Option<f64>,
}

impl Reading {
    /// Observation time as a UTC datetime
    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// Backfill job lifecycle
///
/// `Pending -> Running -> {Completed, Failed, Paused}`, `Paused -> Running`
/// on resume. `Failed` only leaves through an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    /// Job holds (or is about to hold) the station's rate budget
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One requested historical range for a station
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillJob {
    pub id: i64,
    pub station_id: StationId,
    /// First day of the range, inclusive
    pub start_date: NaiveDate,
    /// Last day of the range, inclusive
    pub end_date: NaiveDate,
    pub status: JobStatus,
    /// Last completed chunk boundary, epoch milliseconds
    pub cursor: Option<i64>,
    pub requests_made: u64,
    pub records_inserted: u64,
    pub error_message: Option<String>,
}

impl BackfillJob {
    /// Window start in epoch milliseconds
    pub fn start_ms(&self) -> i64 {
        day_start_ms(self.start_date)
    }

    /// Window end (exclusive) in epoch milliseconds
    pub fn end_ms(&self) -> i64 {
        self.end_date
            .checked_add_days(Days::new(1))
            .map(day_start_ms)
            .unwrap_or(i64::MAX)
    }
}

/// Validate a requested date range.
///
/// Both dates are inclusive, so a single-day range is allowed.
pub fn validate_range(
    start: NaiveDate,
    end: NaiveDate,
    max_days: i64,
) -> Result<(), BackfillError> {
    if start > end {
        return Err(BackfillError::InvalidRange(format!(
            "start date {} is after end date {}",
            start, end
        )));
    }
    let days = (end - start).num_days() + 1;
    if days > max_days {
        return Err(BackfillError::InvalidRange(format!(
            "range of {} days exceeds the limit of {} days",
            days, max_days
        )));
    }
    Ok(())
}

fn day_start_ms(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or_default()
}

/// Read-only view of a job for status polling
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    #[serde(flatten)]
    pub job: BackfillJob,
    /// Average time per chunk times the chunks left, once one chunk finished
    pub estimated_time_remaining: Option<Duration>,
}

impl From<BackfillJob> for JobSnapshot {
    fn from(job: BackfillJob) -> Self {
        Self {
            job,
            estimated_time_remaining: None,
        }
    }
}
