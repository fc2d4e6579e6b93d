//! # Database Module
//!
//! This module handles the PostgreSQL side of the draw backend.
//! We store:
//!
//! - Raffles and their funding progress
//! - Ticket reservations and the live number claims
//! - Payment transactions (unique per provider payment id)
//! - Lottery draws and resolved winners
//! - Reconciliation flags for operators
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      DATABASE LAYER                              │
//! │                                                                  │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │                   Connection Pool                         │   │
//! │  │                  (deadpool-postgres)                      │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │                              │                                   │
//! │         ┌────────────────────┼────────────────────┐             │
//! │         ▼                    ▼                    ▼             │
//! │  ┌────────────┐      ┌──────────────┐     ┌────────────┐       │
//! │  │  Raffles   │      │ Reservations │     │  Winners   │       │
//! │  │  (locked   │      │  + Tickets   │     │  (one per  │       │
//! │  │ per draw)  │      │              │     │  raffle)   │       │
//! │  └────────────┘      └──────────────┘     └────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod models;
pub mod queries;

use deadpool_postgres::{Config, Pool, PoolError, Runtime};
use tokio_postgres::{NoTls, Config as TokioConfig};
use thiserror::Error;
use tracing::{debug, info, error};

/// Schema applied by [`Database::run_migrations`].
const INITIAL_SCHEMA: &str = include_str!("../../migrations/001_initial_schema.sql");

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to connect to the database
    #[error("Database connection failed: {0}")]
    ConnectionError(String),

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryError(#[from] tokio_postgres::Error),

    /// Migration failed
    #[error("Migration failed: {0}")]
    MigrationError(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A stored value could not be decoded into its model
    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

impl From<PoolError> for DatabaseError {
    fn from(e: PoolError) -> Self {
        DatabaseError::ConnectionError(e.to_string())
    }
}

/// Database connection wrapper.
///
/// Wraps the deadpool connection pool. Cloning is cheap; every clone
/// shares the same pool.
///
/// ## Usage
///
/// ```rust,ignore
/// let db = Database::connect("postgres://...", 10).await?;
/// db.run_migrations().await?;
/// let raffle = queries::get_raffle(db.pool(), raffle_id).await?;
/// ```
#[derive(Clone)]
pub struct Database {
    /// The connection pool
    pool: Pool,
}

impl Database {
    /// Connect to the PostgreSQL database.
    ///
    /// ## Arguments
    ///
    /// * `database_url` - PostgreSQL connection string
    /// * `max_size` - Maximum number of pooled connections
    ///
    /// ## Returns
    ///
    /// * `Ok(Database)` - Connected successfully
    /// * `Err(DatabaseError)` - Connection failed
    pub async fn connect(database_url: &str, max_size: usize) -> Result<Self, DatabaseError> {
        info!("Connecting to database...");

        let tokio_config = database_url.parse::<TokioConfig>()
            .map_err(|e| DatabaseError::ConfigError(format!("Invalid database URL: {}", e)))?;

        // Convert to deadpool config
        let mut config = Config::new();

        if let Some(dbname) = tokio_config.get_dbname() {
            config.dbname = Some(dbname.to_string());
        }
        if let Some(user) = tokio_config.get_user() {
            config.user = Some(user.to_string());
        }
        if let Some(password) = tokio_config.get_password() {
            // Password is &[u8]
            config.password = Some(String::from_utf8_lossy(password).to_string());
        }
        if let Some(tokio_postgres::config::Host::Tcp(host)) = tokio_config.get_hosts().first() {
            config.host = Some(host.clone());
        }
        if let Some(port) = tokio_config.get_ports().first() {
            config.port = Some(*port);
        }

        config.pool = Some(deadpool_postgres::PoolConfig {
            max_size,
            ..Default::default()
        });

        let pool = config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        // Test connection
        let client = pool.get().await?;
        client.query("SELECT 1", &[]).await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        info!("Database connection established (pool size {})", max_size);

        Ok(Self { pool })
    }

    /// Apply the schema.
    ///
    /// The migration only uses `IF NOT EXISTS` statements, so running it on
    /// every start is safe.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        info!("Running database migrations...");

        let client = self.pool.get().await?;

        debug!("Executing migration SQL ({} bytes)", INITIAL_SCHEMA.len());

        match client.batch_execute(INITIAL_SCHEMA).await {
            Ok(_) => {
                info!("Migrations completed successfully");
                Ok(())
            }
            Err(e) => {
                let error_code = e.code().map(|c| c.code().to_string());
                let error_detail = e.as_db_error()
                    .and_then(|db_err| db_err.detail())
                    .unwrap_or("No detail available")
                    .to_string();
                let error_hint = e.as_db_error()
                    .and_then(|db_err| db_err.hint())
                    .unwrap_or("No hint available")
                    .to_string();

                error!("Migration execution error:");
                error!("  Error: {}", e);
                error!("  Code: {:?}", error_code);
                error!("  Detail: {}", error_detail);
                error!("  Hint: {}", error_hint);

                Err(DatabaseError::MigrationError(format!(
                    "{} (code {:?}, detail: {}, hint: {})",
                    e, error_code, error_detail, error_hint
                )))
            }
        }
    }

    /// Check that a connection can be checked out and used.
    pub async fn ping(&self) -> Result<(), DatabaseError> {
        let client = self.pool.get().await?;
        client.query_one("SELECT 1", &[]).await?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

// Re-export commonly used items
pub use models::*;
