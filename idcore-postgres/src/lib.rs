//! # idcore-postgres
//!
//! PostgreSQL backend for idcore, built on `sqlx`:
//!
//! - [`PostgresEventStore`]: the event log and its unique constraint table
//! - [`PostgresProjectionDb`]: statement execution and searches over
//!   projection tables
//! - [`PostgresHandlerStateStore`]: watermarks, failed events, run
//!   timestamps and handler locks
//!
//! All three can share one pool. [`migrate`] creates the engine's tables;
//! projection tables are created by the domain that owns them through
//! [`PostgresProjectionDb::create_tables`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod projection;
mod state;
mod store;

pub use projection::PostgresProjectionDb;
pub use state::PostgresHandlerStateStore;
pub use store::PostgresEventStore;

use nutype::nutype;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const SCHEMA: &str = include_str!("schema.sql");

/// Failures while setting up the backend.
#[derive(Debug, Error)]
pub enum PostgresError {
    /// The pool could not connect.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// A schema script failed.
    #[error("failed to apply postgres schema")]
    MigrationFailed(#[source] sqlx::Error),
}

/// Maximum number of database connections in the pool.
#[nutype(
    validate(greater_or_equal = 1),
    default = 10,
    derive(Debug, Clone, Copy, PartialEq, Eq, Display, Into, Default, Serialize, Deserialize)
)]
pub struct MaxConnections(u32);

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: MaxConnections::default(),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Opens a pool for `connection_string`.
pub async fn connect(
    connection_string: &str,
    config: &PostgresConfig,
) -> Result<PgPool, PostgresError> {
    PgPoolOptions::new()
        .max_connections(config.max_connections.into_inner())
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(connection_string)
        .await
        .map_err(PostgresError::ConnectionFailed)
}

/// Creates the event log, constraint and handler state tables if missing.
pub async fn migrate(pool: &PgPool) -> Result<(), PostgresError> {
    let _ = sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(PostgresError::MigrationFailed)?;
    info!("idcore schema is up to date");
    Ok(())
}
