//! Listener setup and graceful shutdown.

use anyhow::{Context, Result};
use sbx_core::config::{expand_tilde, ServerConfig};
use sbx_sync::ArchiveStore;
use std::sync::Arc;
use tracing::info;

use crate::accounts::JsonAccountStore;
use crate::router::{self, AppState};

/// Serve the sync API on `config.listen` until Ctrl-C or SIGTERM.
pub async fn run(config: &ServerConfig) -> Result<()> {
    let accounts = JsonAccountStore::open(expand_tilde(&config.accounts_file))
        .await
        .context("opening account store")?;
    let archives =
        ArchiveStore::new(expand_tilde(&config.archive_dir)).context("opening archive dir")?;
    let app = router::build(AppState::new(Arc::new(accounts), archives));

    let addr = &config.listen;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("bind {addr}: {e}"))?;

    info!(addr = %addr, "sbxd: listening on /api/v1/login, /api/v1/sync, /healthz");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("server: {e}"))?;

    info!("sbxd: shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("ctrl-c handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("sbxd: shutdown signal received, draining...");
}
