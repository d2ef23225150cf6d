//! PostgreSQL persistence.
//!
//! Uses sqlx with runtime queries; rows are read into `*Row` structs and
//! converted into domain records at the edge.

mod audit;
mod directory;
mod policies;

pub use audit::PgAuditSink;
pub use directory::PgCharacterDirectory;
pub use policies::PgPolicyStore;

use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{error, info};

use crate::config::DatabaseConfig;
use crate::error::{ErrorCode, KeystoneError, Result};

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    max_connections: u32,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await?;

        info!(max_connections = config.max_connections, "Database pool ready");
        Ok(Self {
            pool,
            max_connections: config.max_connections,
        })
    }

    /// Run migrations with logging.
    pub async fn migrate(&self) -> Result<()> {
        let start = Instant::now();
        sqlx::migrate!("./migrations").run(&self.pool).await.map_err(|e| {
            error!(error = %e, "Database migration failed");
            KeystoneError::from(sqlx::Error::Migrate(Box::new(e)))
        })?;
        info!(duration_ms = start.elapsed().as_millis() as u64, "Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip latency of `SELECT 1`.
    pub async fn check_connectivity(&self) -> Result<Duration> {
        let start = Instant::now();
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(start.elapsed())
    }

    pub fn pool_metrics(&self) -> PoolMetrics {
        let size = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        PoolMetrics {
            pool_size: size,
            idle_connections: idle,
            active_connections: size.saturating_sub(idle),
            max_connections: self.max_connections,
        }
    }
}

/// Snapshot of the connection pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub pool_size: u32,
    pub idle_connections: u32,
    pub active_connections: u32,
    pub max_connections: u32,
}

/// Map a stored enum string back to its type, treating junk as corruption.
pub(crate) fn decode<T>(column: &'static str, value: &str, parsed: Option<T>) -> Result<T> {
    parsed.ok_or_else(|| {
        KeystoneError::with_internal(
            ErrorCode::IntegrityViolation,
            "Stored authorization data is invalid",
            format!("column {} holds unexpected value '{}'", column, value),
        )
    })
}
