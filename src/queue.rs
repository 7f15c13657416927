use std::time::Duration;

use anyhow::Result;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::AppState;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub artifacts_removed: usize,
    pub cache_entries_purged: usize,
    pub rate_windows_pruned: usize,
}

/// Periodic retention sweep; stops when `shutdown` fires.
pub fn spawn_cleanup_worker(state: AppState, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = time::interval(CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => {
                    debug!("Cleanup worker stopping");
                    break;
                }
            }
            match run_cleanup_pass(&state).await {
                Ok(report) if report != CleanupReport::default() => {
                    info!(
                        artifacts = report.artifacts_removed,
                        cache_entries = report.cache_entries_purged,
                        rate_windows = report.rate_windows_pruned,
                        "Cleanup pass removed stale state"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!("Cleanup worker error: {err:#}"),
            }
        }
    });
}

pub async fn run_cleanup_pass(state: &AppState) -> Result<CleanupReport> {
    let mut report = CleanupReport {
        cache_entries_purged: state.analysis.cache().purge_expired(),
        rate_windows_pruned: state.limiter.prune().await,
        ..CleanupReport::default()
    };

    let retention = state.config.result_retention_seconds;
    let artifacts = state.analysis.artifacts();
    if retention > 0 && artifacts.root().exists() {
        report.artifacts_removed = artifacts
            .purge_older_than(Duration::from_secs(retention))
            .await?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, job_store::JobStore};
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::task::TaskTracker;

    fn state(work_dir: &std::path::Path, retention: u64) -> AppState {
        let config = Config {
            work_dir: work_dir.to_path_buf(),
            result_retention_seconds: retention,
            ..Config::default()
        };
        AppState::new(
            Arc::new(config),
            JobStore::open_in_memory().expect("store"),
            CancellationToken::new(),
            TaskTracker::new(),
        )
    }

    #[tokio::test]
    async fn zero_retention_keeps_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(dir.path(), 0);
        state
            .analysis
            .artifacts()
            .write_result("tok", &json!({}))
            .await
            .expect("write");

        let report = run_cleanup_pass(&state).await.expect("cleanup");
        assert_eq!(report.artifacts_removed, 0);
        assert!(state.analysis.artifacts().results_available("tok").await);
    }

    #[tokio::test]
    async fn fresh_artifacts_survive_retention_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(dir.path(), 3600);
        state
            .analysis
            .artifacts()
            .write_result("tok", &json!({}))
            .await
            .expect("write");

        let report = run_cleanup_pass(&state).await.expect("cleanup");
        assert_eq!(report, CleanupReport::default());
        assert!(state.analysis.artifacts().results_available("tok").await);
    }

    #[tokio::test]
    async fn missing_work_dir_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(&dir.path().join("not-created"), 60);
        assert_eq!(
            run_cleanup_pass(&state).await.expect("cleanup"),
            CleanupReport::default()
        );
    }
}
