//! evalboard -- run lifecycle monitoring and score aggregation for an LLM
//! evaluation platform.
//!
//! The run monitor fails stalled evaluation runs and restarts paused ones;
//! the score engine folds evaluation records into per-model batch
//! leaderboards. Both sit on one SQLite database.

pub mod api;
pub mod config;
pub mod monitor;
pub mod runs;
pub mod scores;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::AppConfig;
use crate::monitor::RunLifecycleMonitor;
use crate::runs::{SqliteRunStore, StoreResumer};

/// Monitor wired to the SQLite run store and the store-backed resumer.
pub fn build_monitor(pool: storage::Pool, config: &AppConfig) -> RunLifecycleMonitor {
    let store = SqliteRunStore::new(pool);
    let resumer = StoreResumer::new(store.clone());
    RunLifecycleMonitor::new(Arc::new(store), Arc::new(resumer), config.monitor.clone())
}

/// Start the evalboard daemon: monitor loops and API server, until Ctrl-C.
pub async fn serve(config: &AppConfig, bind: &str) -> Result<()> {
    // 1. Initialize Storage
    let db_path = &config.storage.db_path;
    tracing::info!(%db_path, "Initializing database");
    let pool = storage::open_pool(db_path)?;

    // 2. Start the run lifecycle monitor (background tasks)
    let run_monitor = Arc::new(build_monitor(pool.clone(), config));
    let handle = monitor::spawn(run_monitor);

    // 3. Start API Server
    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address '{bind}'"))?;
    let app = api::router(api::state::AppState::new(pool, config.aggregation.on_model_failure));

    tracing::info!(%addr, "evalboard listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    handle.abort();
    tracing::info!("evalboard stopped");
    Ok(())
}

/// Resolves on Ctrl-C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
