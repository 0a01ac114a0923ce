//! Colony Sweeper
//!
//! Background maintenance for a colony deployment. Connects to the shared
//! Postgres store, makes sure the schema exists, and keeps requeueing
//! orphaned job requests and releasing expired resource leases until
//! interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use colony_orchestrator::config::Config;
use colony_orchestrator::db;
use colony_orchestrator::repository::PgStore;
use colony_orchestrator::scheduler::Sweeper;
use colony_orchestrator::service::{ResourceAllocator, StateTransitionManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "colony_orchestrator=info,colony_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Colony Sweeper");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!("Connecting to database...");

    let pool = db::create_pool(&config)
        .await
        .context("Failed to create database pool")?;

    info!("Database connection pool created");

    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let store = Arc::new(PgStore::new(pool));
    let transitions = StateTransitionManager::from_store(store.clone());
    let allocator = ResourceAllocator::new(store);
    let sweeper = Sweeper::new(&config, transitions, allocator);

    info!("Sweeper initialized successfully");

    tokio::select! {
        result = sweeper.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping sweeper");
        }
    }

    Ok(())
}
