// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lanewise Core - standalone heartbeat daemon
//!
//! Runs the heartbeat against a PostgreSQL store shared with embedded
//! engines, recovering orphans and delivering timers, triggers and switches.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use lanewise_core::config::Config;
use lanewise_core::migrations;
use lanewise_core::{Engine, PostgresStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lanewise_core=info".parse()?),
        )
        .init();

    info!("Starting Lanewise Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        engine_id = %config.engine.engine_id,
        heartbeat_mode = ?config.engine.heartbeat_mode,
        heartbeat_enabled = config.engine.heartbeat_enabled,
        "Configuration loaded"
    );

    // Connect to database
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;

    info!("Database connection established");

    // Verify connection
    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
    info!(result = row.0, "Database health check passed");

    info!("Running database migrations...");
    migrations::run_postgres(&pool).await?;
    info!("Migrations completed");

    let heartbeat_enabled = config.engine.heartbeat_enabled;
    let engine = Engine::builder()
        .store(Arc::new(PostgresStore::new(pool.clone())))
        .config(config.engine)
        .build()?;

    info!(engine_id = %engine.engine_id(), "Lanewise Core initialized successfully");

    let heartbeat = if heartbeat_enabled {
        Some(engine.start_heartbeat())
    } else {
        info!("Heartbeat disabled");
        None
    };

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Some(heartbeat) = heartbeat {
        heartbeat.shutdown().await;
    }

    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
