//! Application configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;
use tracing::warn;

use crate::errors::BackfillError;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub vendor: VendorConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub poller: PollerConfig,
}

/// Ambient Weather REST API access
#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct VendorConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub api_key: String,
    pub application_key: String,
    /// Station MAC address used when none is given explicitly
    pub mac_address: String,
    /// Minimum spacing between two consecutive requests
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    #[serde(default = "default_min_interval")]
    pub min_interval: Duration,
    /// Wait after a 429 before the single retry.
    ///
    /// The vendor does not document this; tune it from the recovery times
    /// the client logs.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_cooldown")]
    pub cooldown: Duration,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Maximum readings the vendor returns per call
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct BackfillConfig {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_chunk_size")]
    pub chunk_size: Duration,
    #[serde(default = "default_max_chunk_retries")]
    pub max_chunk_retries: u32,
    #[serde(default = "default_max_range_days")]
    pub max_range_days: i64,
    /// An active job whose owner has not sent a heartbeat for this long is
    /// considered abandoned and may be paused by another process
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_stale_after")]
    pub stale_after: Duration,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct PollerConfig {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_poll_interval")]
    pub interval: Duration,
}

fn default_base_url() -> String {
    "https://rt.ambientweather.net/v1".to_string()
}

fn default_min_interval() -> Duration {
    Duration::from_millis(1100)
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_page_limit() -> usize {
    288
}

fn default_chunk_size() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_max_chunk_retries() -> u32 {
    3
}

fn default_max_range_days() -> i64 {
    3660
}

fn default_stale_after() -> Duration {
    Duration::from_secs(120)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_chunk_retries: default_max_chunk_retries(),
            max_range_days: default_max_range_days(),
            stale_after: default_stale_after(),
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(
                Environment::with_prefix("WXBACKFILL")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

impl VendorConfig {
    pub fn validate(&self) -> Result<(), BackfillError> {
        if self.base_url.trim().is_empty() {
            return Err(config_error("Vendor base URL cannot be empty"));
        }
        if self.api_key.trim().is_empty() || self.application_key.trim().is_empty() {
            return Err(config_error("Vendor API key and application key are required"));
        }
        if self.min_interval.is_zero() {
            return Err(config_error("Minimum request interval must be greater than zero"));
        }
        if self.page_limit == 0 {
            return Err(config_error("Page limit must be greater than zero"));
        }
        Ok(())
    }
}

impl DatabaseConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), BackfillError> {
        self.validate_path()?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                self.ensure_directory_exists(parent)?;
            }
        }
        Ok(())
    }

    fn validate_path(&self) -> Result<(), BackfillError> {
        if self.path.as_os_str().is_empty() {
            return Err(config_error("Database path cannot be empty"));
        }
        Ok(())
    }

    fn ensure_directory_exists(&self, dir: &Path) -> Result<(), BackfillError> {
        if !dir.exists() {
            warn!("Database directory does not exist, attempting to create it");
            std::fs::create_dir_all(dir).map_err(|e| BackfillError::ConfigurationError {
                message: format!("Could not create database directory: {}", e),
            })?;
        }
        Ok(())
    }
}

impl BackfillConfig {
    pub fn validate(&self) -> Result<(), BackfillError> {
        if self.chunk_size < Duration::from_millis(1) {
            return Err(config_error("Chunk size must be at least one millisecond"));
        }
        if self.max_range_days <= 0 {
            return Err(config_error("Maximum range must be at least one day"));
        }
        if self.stale_after.is_zero() {
            return Err(config_error("Stale owner timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl PollerConfig {
    pub fn validate(&self) -> Result<(), BackfillError> {
        if self.interval.is_zero() {
            return Err(config_error("Poll interval must be greater than zero"));
        }
        Ok(())
    }
}

fn config_error(message: &str) -> BackfillError {
    BackfillError::ConfigurationError {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn vendor() -> VendorConfig {
        VendorConfig {
            base_url: default_base_url(),
            api_key: "key".to_string(),
            application_key: "app".to_string(),
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            min_interval: default_min_interval(),
            cooldown: default_cooldown(),
            request_timeout: default_request_timeout(),
            page_limit: default_page_limit(),
        }
    }

    #[test]
    fn test_load_config() {
        env::set_var("WXBACKFILL__VENDOR__API_KEY", "abc");
        env::set_var("WXBACKFILL__VENDOR__APPLICATION_KEY", "def");
        env::set_var("WXBACKFILL__VENDOR__MAC_ADDRESS", "AA:BB:CC:DD:EE:FF");
        env::set_var("WXBACKFILL__VENDOR__COOLDOWN", "45");
        env::set_var("WXBACKFILL__DATABASE__PATH", "/tmp/weather.db");
        env::set_var("WXBACKFILL__BACKFILL__MAX_CHUNK_RETRIES", "5");

        let config = AppConfig::load().unwrap();
        assert_eq!(config.vendor.api_key, "abc");
        assert_eq!(config.vendor.application_key, "def");
        assert_eq!(config.vendor.cooldown, Duration::from_secs(45));
        assert_eq!(config.vendor.min_interval, Duration::from_millis(1100));
        assert_eq!(config.vendor.page_limit, 288);
        assert_eq!(config.database.path, PathBuf::from("/tmp/weather.db"));
        assert_eq!(config.backfill.max_chunk_retries, 5);
        assert_eq!(config.backfill.chunk_size, Duration::from_secs(86400));
        assert_eq!(config.poller.interval, Duration::from_secs(60));
    }

    #[test]
    fn test_vendor_config_validate() {
        assert!(vendor().validate().is_ok());

        let missing_key = VendorConfig {
            api_key: " ".to_string(),
            ..vendor()
        };
        assert!(missing_key.validate().is_err());

        let zero_interval = VendorConfig {
            min_interval: Duration::ZERO,
            ..vendor()
        };
        assert!(zero_interval.validate().is_err());

        let zero_limit = VendorConfig {
            page_limit: 0,
            ..vendor()
        };
        assert!(zero_limit.validate().is_err());
    }

    #[test]
    fn test_database_config_validate() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("nested").join("weather.db"),
        };

        assert!(config.validate().is_ok());
        assert!(dir.path().join("nested").exists());
    }

    #[test]
    fn test_database_config_validate_invalid_path() {
        let config = DatabaseConfig {
            path: PathBuf::from(""),
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sections_validate_independently() {
        let keyless = VendorConfig {
            api_key: String::new(),
            application_key: String::new(),
            ..vendor()
        };
        let database = DatabaseConfig {
            path: PathBuf::from("weather.db"),
        };

        // Listing or resetting jobs only touches the database section
        assert!(keyless.validate().is_err());
        assert!(database.validate().is_ok());
        assert!(PollerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_backfill_config_validate_zero_chunk() {
        let config = BackfillConfig {
            chunk_size: Duration::ZERO,
            ..BackfillConfig::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backfill_config_validate_zero_stale_after() {
        let config = BackfillConfig {
            stale_after: Duration::ZERO,
            ..BackfillConfig::default()
        };

        assert!(config.validate().is_err());
        assert!(BackfillConfig::default().validate().is_ok());
    }
}
