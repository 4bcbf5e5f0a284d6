//! Prepare the scheduler database.
//!
//! Runs migrations and seeds the load balancer port pool from
//! `DOCKYARD_PORT_RANGE`. Safe to run repeatedly.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dockyard_scheduler::config::Config;
use dockyard_scheduler::db::Database;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to DOCKYARD_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let db = Database::connect(&config.database)
        .await
        .context("failed to connect to database")?;

    db.run_migrations()
        .await
        .context("failed to run migrations")?;

    let inserted = db
        .port_allocator()
        .populate(config.port_range.clone())
        .await
        .context("failed to populate port pool")?;
    info!(
        start = *config.port_range.start(),
        end = *config.port_range.end(),
        inserted,
        "Port pool ready"
    );

    db.health_check().await.context("database health check failed")?;
    info!("Database ready");
    Ok(())
}
