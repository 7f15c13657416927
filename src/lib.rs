pub mod analysis;
pub mod api;
pub mod artifact_store;
pub mod auth;
pub mod client;
pub mod codes;
pub mod config;
pub mod error;
pub mod job_cache;
pub mod job_store;
pub mod models;
pub mod notify;
pub mod queue;
pub mod rate_limit;
pub mod runner;

use std::{sync::Arc, time::Duration};

use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    analysis::AnalysisService, config::Config, job_store::JobStore, rate_limit::RateLimiter,
    runner::ProcessRunner,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub analysis: AnalysisService,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    /// `shutdown` stops running analyses; `tasks` tracks their continuations.
    pub fn new(
        config: Arc<Config>,
        jobs: JobStore,
        shutdown: CancellationToken,
        tasks: TaskTracker,
    ) -> Self {
        let runner = ProcessRunner::from_config(&config, shutdown);
        let limiter = Arc::new(RateLimiter::new(
            Duration::from_millis(config.rate_limit_window_ms),
            config.rate_limit_max_requests,
        ));
        let analysis = AnalysisService::new(config.clone(), jobs, runner, tasks);
        Self {
            config,
            analysis,
            limiter,
        }
    }
}
