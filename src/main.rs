use std::{sync::Arc, time::Duration};

use anyhow::Result;
use geo_analysis_api::{api, client, config::Config, job_store::JobStore, queue, AppState};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "geo_analysis_api=info,tower_http=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if client::maybe_run_from_cli(&args).await? {
        return Ok(());
    }

    let config = Arc::new(Config::from_env()?);
    let jobs = JobStore::open(&config.db_path)?;
    let shutdown = CancellationToken::new();
    let tasks = TaskTracker::new();

    let state = AppState::new(config.clone(), jobs, shutdown.clone(), tasks.clone());
    state.analysis.artifacts().ensure_root().await?;
    queue::spawn_cleanup_worker(state.clone(), shutdown.clone());

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("geo-analysis-api listening on {}", config.bind_addr);
    // Cancelling also closes open status streams so the server can drain.
    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutting down, stopping running analyses");
            stop.cancel();
        })
        .await?;

    tasks.close();
    let grace = Duration::from_millis(config.shutdown_grace_ms);
    if tokio::time::timeout(grace, tasks.wait()).await.is_err() {
        warn!(
            pending = tasks.len(),
            "Analyses still finishing after {} ms, exiting anyway",
            config.shutdown_grace_ms
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {err}");
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
}
