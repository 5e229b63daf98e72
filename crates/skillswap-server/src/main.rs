//! # skillswap-server
//!
//! Real-time core of the SkillSwap platform.
//!
//! This binary provides:
//! - **PieceStore** that splits uploads into SHA-256 addressed pieces and
//!   verifies every piece on read
//! - **SwarmTracker** recording who seeds, leeches or completed a resource
//! - **AccessGate** deciding who may fetch a resource, backed by skill grants
//! - **Connection registry** actor owning every live WebSocket session
//! - **Message delivery** with persistence and replay on reconnect
//! - **REST API** (axum) plus one WebSocket endpoint carrying JSON frames

mod access;
mod api;
mod config;
mod db;
mod delivery;
mod error;
mod piece_store;
mod registry;
mod session;
mod tracker;

use tracing::info;
use tracing_subscriber::EnvFilter;

use skillswap_shared::constants::APP_NAME;
use skillswap_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,skillswap_server=debug")),
        )
        .init();

    info!("Starting {} server v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the database and wire the components
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;
    let http_addr = config.http_addr;
    let app_state = AppState::build(config, db).await?;
    let registry = app_state.registry.clone();

    // -----------------------------------------------------------------------
    // 4. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                registry.shutdown().await;
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // Closes every session queue so writers send their close frames.
    registry.shutdown().await;

    Ok(())
}
