//! Persistent state shared between scheduler processes.
//!
//! Two tables live here, both touched only in short transactions:
//! - `ports`: the host port pool handed to load balancers
//! - `stack_update_queue`: one row per pending stack update
//!
//! Balancers, services and stacks are owned by the backend and never stored.

mod error;

pub use error::DbError;

use std::path::PathBuf;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use crate::lb::ports::PgPortAllocator;
use crate::stack::queue::PgQueueStore;

const DEFAULT_DATABASE_URL: &str = "postgres://localhost/dockyard";

/// Pool settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a port claim or queue poll waits for a connection.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 5,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl DbConfig {
    /// Read `DOCKYARD_DATABASE_URL` (or `DATABASE_URL`), `DB_MAX_CONNECTIONS`
    /// and `DB_MIN_CONNECTIONS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let database_url = std::env::var("DOCKYARD_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .unwrap_or(defaults.database_url);

        let parsed = |key: &str, fallback: u32| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(fallback)
        };

        Self {
            database_url,
            max_connections: parsed("DB_MAX_CONNECTIONS", defaults.max_connections),
            min_connections: parsed("DB_MIN_CONNECTIONS", defaults.min_connections),
            ..defaults
        }
    }
}

/// Handle to the scheduler database.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            "Connecting to scheduler database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Apply the migrations shipped with this crate.
    ///
    /// The directory is looked up relative to the working directory first, so
    /// the binary works both from the crate and from the workspace root.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let candidates = [
            PathBuf::from("migrations"),
            PathBuf::from("services/scheduler/migrations"),
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];

        let mut last_error = None;
        for dir in &candidates {
            match Migrator::new(dir.as_path()).await {
                Ok(migrator) => {
                    debug!(dir = %dir.display(), "Applying migrations");
                    migrator.run(&self.pool).await.map_err(DbError::Migration)?;
                    info!("Scheduler schema up to date");
                    return Ok(());
                }
                Err(err) => last_error = Some(err.to_string()),
            }
        }

        Err(DbError::MigrationDirNotFound {
            tried: candidates
                .iter()
                .map(|dir| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            last_error: last_error.unwrap_or_default(),
        })
    }

    pub fn port_allocator(&self) -> PgPortAllocator {
        PgPortAllocator::new(self.pool.clone())
    }

    pub fn queue_store(&self) -> PgQueueStore {
        PgQueueStore::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 5);
        assert!(config.min_connections <= config.max_connections);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
    }
}
