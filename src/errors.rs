//! Errors for weather backfill
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackfillError {
    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited by vendor after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("Vendor returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed vendor response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid station identifier: {0}")]
    InvalidStation(String),

    #[error("A backfill job is already running for station {0}")]
    JobAlreadyRunning(String),

    #[error("Backfill job {0} not found")]
    JobNotFound(i64),

    #[error("Backfill job {id} cannot {action} while {status}")]
    InvalidTransition {
        id: i64,
        action: &'static str,
        status: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("HTTP client initialization failed: {0}")]
    HttpClientInit(#[source] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackfillError {
    /// Errors worth retrying the same chunk for after a cooldown.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackfillError::Timeout | BackfillError::RateLimited { .. } | BackfillError::Network(_)
        )
    }
}
