//! Storage layer for the pipeline.
//!
//! This module provides database operations for:
//! - Cursors (per-processor resume positions)
//! - Mempool (staged writes with provenance)
//! - CRDT registers and the canonical projection / per-table views
//! - Error annotations and resets

use anyhow::{Context, Result};
use spinsync_core::{Table, DEFAULT_REGISTER_CAPACITY_BYTES};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub mod crdt;
pub mod cursor;
pub mod errors;
pub mod mempool;
pub mod types;

pub use errors::ErrorFilter;
pub use types::*;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_MIN_CONNECTIONS: u32 = 1;

/// Database storage for the pipeline.
///
/// Provides async access to SQLite database with connection pooling.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
    register_capacity: usize,
}

impl Storage {
    /// Create a new storage instance with the given database URL.
    ///
    /// This will create the database file if it doesn't exist. Call
    /// [`Storage::run_migrations`] before use.
    ///
    /// # Example
    /// ```no_run
    /// # use spinsync_pipeline::storage::Storage;
    /// # async fn example() -> anyhow::Result<()> {
    /// let storage = Storage::new("sqlite://spinsync.db", None, None).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(
        database_url: &str,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    ) -> Result<Self> {
        info!("Connecting to database: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {}", database_url))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS))
            .min_connections(min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS))
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        info!("Database connection established");

        Ok(Self {
            pool,
            register_capacity: DEFAULT_REGISTER_CAPACITY_BYTES,
        })
    }

    /// Set the maximum serialized size of a CRDT register.
    pub fn with_register_capacity(mut self, max_bytes: usize) -> Self {
        self.register_capacity = max_bytes;
        self
    }

    /// Maximum serialized size of a CRDT register.
    pub fn register_capacity(&self) -> usize {
        self.register_capacity
    }

    /// Create a new storage instance with a specific file path.
    pub async fn new_with_path<P: AsRef<Path>>(
        path: P,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    ) -> Result<Self> {
        let database_url = format!("sqlite://{}", path.as_ref().display());
        Self::new(&database_url, max_connections, min_connections).await
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Migrations completed successfully");

        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        info!("Closing database connection");
        self.pool.close().await;
    }

    /// Get database statistics.
    pub async fn stats(&self) -> Result<DatabaseStats> {
        let cursor_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cursors")
            .fetch_one(&self.pool)
            .await?;

        let pending_writes: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM mempool WHERE quarantined = 0")
                .fetch_one(&self.pool)
                .await?;

        let quarantined_writes: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM mempool WHERE quarantined = 1")
                .fetch_one(&self.pool)
                .await?;

        let register_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM crdt_state")
            .fetch_one(&self.pool)
            .await?;

        let active_errors: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM error_annotations WHERE status != 'reset'",
        )
        .fetch_one(&self.pool)
        .await?;

        let mut records_per_table = Vec::with_capacity(Table::ALL.len());
        for table in Table::ALL {
            records_per_table.push((table, self.count_canonical(table).await?));
        }

        Ok(DatabaseStats {
            cursor_count: cursor_count as u64,
            pending_writes: pending_writes as u64,
            quarantined_writes: quarantined_writes as u64,
            register_count: register_count as u64,
            active_errors: active_errors as u64,
            records_per_table,
        })
    }

    /// Check database health.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;

        Ok(())
    }
}

/// Database statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Processors with a persisted cursor
    pub cursor_count: u64,

    /// Staged writes waiting for a drain
    pub pending_writes: u64,

    /// Staged writes held back by integrity errors
    pub quarantined_writes: u64,

    /// CRDT registers
    pub register_count: u64,

    /// Error annotations not yet reset
    pub active_errors: u64,

    /// Materialized records per canonical table
    pub records_per_table: Vec<(Table, u64)>,
}

pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
