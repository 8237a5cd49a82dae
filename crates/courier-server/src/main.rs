//! # courier-server
//!
//! Real-time chat delivery server.
//!
//! This binary provides:
//! - **Conversation ledger** in SQLite: messages, per-user conversation
//!   views with unread counters, group membership snapshots
//! - **Delivery router** that persists first and then pushes each message to
//!   every live device of every recipient over WebSocket
//! - **Content-addressed file storage** with reference counting; identical
//!   uploads share one blob on disk
//! - **Cleanup scheduler** that evicts idle connections and reclaims files
//!   nobody references any more
//! - **REST API** (axum) for history, conversations, uploads and downloads

mod api;
mod blob_store;
mod cleanup;
mod config;
mod connections;
mod content_store;
mod db;
mod error;
mod router;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::blob_store::BlobStore;
use crate::cleanup::{CleanupScheduler, CleanupSettings};
use crate::config::ServerConfig;
use crate::connections::ConnectionRegistry;
use crate::content_store::ContentStore;
use crate::db::SharedDb;
use crate::router::DeliveryRouter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,courier_server=debug,courier_store=info")
            }),
        )
        .init();

    info!("Starting Courier server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = SharedDb::open(&config.database_path).await?;
    info!(path = %config.database_path.display(), "Database ready");

    // Blob store (creates directory if missing)
    let blobs = BlobStore::new(config.blob_storage_path.clone(), config.max_blob_size).await?;
    let content = Arc::new(ContentStore::new(db.clone(), blobs));
    info!(path = %content.blobs().base_path().display(), "Content store ready");

    let registry = Arc::new(ConnectionRegistry::new());
    let router = Arc::new(DeliveryRouter::new(
        db.clone(),
        registry.clone(),
        config.push_timeout,
    ));

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    let scheduler = CleanupScheduler::spawn(
        registry.clone(),
        content.clone(),
        CleanupSettings::from(&config),
    );

    let http_addr = config.http_addr;
    let app_state = AppState {
        db,
        content,
        registry: registry.clone(),
        router,
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server until it fails or Ctrl+C arrives
    // -----------------------------------------------------------------------
    let outcome = tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "HTTP server failed");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    // -----------------------------------------------------------------------
    // 6. Teardown
    // -----------------------------------------------------------------------
    scheduler.shutdown().await;
    registry.close_all().await;

    outcome
}
