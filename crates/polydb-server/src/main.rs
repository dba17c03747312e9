// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! polydb Server - entry point.
//!
//! Loads the cloud topology, connects the execution store, wires the
//! executors, and serves the HTTP API until a shutdown signal arrives.

use std::sync::Arc;

use polydb_core::config::{CloudConfig, EnvSettings};
use polydb_core::store;
use polydb_server::auth::EnvPasswordVerifier;
use polydb_server::{AppState, router};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "polydb_server=info,polydb_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config_path =
        std::env::var("POLYDB_CONFIG").unwrap_or_else(|_| "config/clouds.json".to_string());
    let config = CloudConfig::from_file(&config_path)?;
    let settings = EnvSettings::from_env()?;

    info!(
        config_path = %config_path,
        sql_clouds = config.sql_clouds().count(),
        kv_clouds = config.kv_clouds.len(),
        "Topology loaded"
    );

    let execution_store = store::connect(&settings).await?;
    info!("Execution store connected");

    let verifier = Arc::new(EnvPasswordVerifier::from_env());
    let state = AppState::new(config, execution_store, &settings, verifier);
    let app = router(state);

    let port: u16 = std::env::var("POLYDB_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "polydb server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    info!("polydb server shut down");
    Ok(())
}
