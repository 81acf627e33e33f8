//! WattSwap server entry point
//!
//! Startup order matters: configuration, logging, database, then recovery of
//! in-flight transfers, and only then the gateway starts accepting device
//! connections and trade requests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router,
    routing::{get, post},
};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use wattswap::config::AppConfig;
use wattswap::device::device_ws_handler;
use wattswap::device::registry::DeviceRegistry;
use wattswap::gateway::state::AppState;
use wattswap::logging::init_logging;
use wattswap::transfer::api::{health_check, initiate_trade, list_active_transfers};
use wattswap::transfer::coordinator::TransferCoordinator;
use wattswap::transfer::recovery::recover_in_flight;
use wattswap::transfer::store::{PgTransferStore, TransferStore};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env);
    let _log_guard = init_logging(&config);

    info!(
        env = %env,
        git_hash = env!("GIT_HASH"),
        "Starting wattswap server"
    );

    let postgres_url = config
        .postgres_url
        .as_deref()
        .context("postgres_url must be set in config")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(postgres_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    info!("PostgreSQL connection pool established");

    let pg_store = PgTransferStore::new(pool);
    pg_store
        .ensure_schema()
        .await
        .map_err(|e| anyhow::anyhow!("Schema setup failed: {}", e))?;

    let store: Arc<dyn TransferStore> = Arc::new(pg_store);
    let registry = Arc::new(DeviceRegistry::new());
    let coordinator = TransferCoordinator::new(
        store.clone(),
        registry.clone(),
        Duration::from_secs(config.transfer.timeout_secs),
    );

    // Recover before accepting any telemetry
    let restored = recover_in_flight(&coordinator, &store)
        .await
        .map_err(|e| anyhow::anyhow!("Recovery failed: {}", e))?;
    info!(restored, "Startup recovery finished");

    let state = Arc::new(AppState::new(registry, coordinator, store));

    let app = Router::new()
        .route("/ws", get(device_ws_handler))
        .route("/api/v1/trade", post(initiate_trade))
        .route("/api/v1/transfers/active", get(list_active_transfers))
        .route("/api/v1/health", get(health_check))
        .with_state(state);

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, "Gateway listening");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
