// src/database.rs
use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{error, info};

use crate::{config::DatabaseConfig, errors::BackfillError};

pub mod checkpoints;
pub mod jobs;
pub mod models;
pub mod readings;

pub use checkpoints::CheckpointManager;
pub use jobs::JobStore;
pub use readings::ReadingWriter;

/// Embedded store for readings and backfill bookkeeping
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open the database described by `config`, creating it if needed
    pub async fn open(config: &DatabaseConfig) -> Result<Self, BackfillError> {
        config.validate()?;
        Self::open_path(&config.path).await
    }

    /// Open or create the database with durable settings
    pub async fn open_path(path: &Path) -> Result<Self, BackfillError> {
        info!("Opening database at {}", path.display());
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            // Checkpoints must survive a crash once committed
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, BackfillError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .inspect_err(|e| error!("Failed to open database: {}", e))?;

        Self::new(pool).await
    }

    /// Wrap an existing pool and bring the schema up to date
    pub async fn new(pool: SqlitePool) -> Result<Self, BackfillError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .inspect_err(|e| error!("Failed to run migrations: {}", e))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn readings(&self) -> ReadingWriter {
        ReadingWriter::new(self.pool.clone())
    }

    pub fn checkpoints(&self) -> CheckpointManager {
        CheckpointManager::new(self.pool.clone())
    }

    pub fn jobs(&self) -> JobStore {
        JobStore::new(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
