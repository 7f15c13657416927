use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::{stream, Stream, StreamExt};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    artifact_store::{delete_file_if_exists, is_valid_token, read_json, ArtifactStore},
    codes::SystemCode,
    config::Config,
    error::AnalysisError,
    job_cache::JobCache,
    job_store::JobStore,
    models::{
        AcceptedResponse, AnalysisRequest, Caller, JobMetadata, JobStats, JobStatus, JobUpdate,
        NewAnalysisJob, StatusEvent, StatusReply,
    },
    notify::{NotificationBus, Subscription},
    runner::{ProcessRunner, RunError, RunRequest},
};

#[derive(Debug)]
pub enum SubmitOutcome {
    /// Synchronous run; the result payload is returned inline.
    Completed(Value),
    /// Asynchronous run; the client follows `status_url`.
    Accepted(AcceptedResponse),
}

/// Events for one `/stream` connection: whatever is already known, then live
/// bus events up to and including the final one. The live part also ends,
/// without a final event, once `max_duration` passes or on shutdown.
pub struct StatusStream {
    prelude: Vec<StatusEvent>,
    live: Option<(Subscription, mpsc::UnboundedReceiver<StatusEvent>)>,
    max_duration: Duration,
    shutdown: CancellationToken,
}

impl StatusStream {
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    pub fn into_stream(self) -> impl Stream<Item = StatusEvent> + Send + 'static {
        let deadline = Instant::now() + self.max_duration;
        let shutdown = self.shutdown;
        let live = stream::unfold(self.live, move |state| {
            let shutdown = shutdown.clone();
            async move {
                let (subscription, mut rx) = state?;
                let event = tokio::select! {
                    event = rx.recv() => event?,
                    _ = tokio::time::sleep_until(deadline) => {
                        debug!("Status stream reached its time limit");
                        return None;
                    }
                    _ = shutdown.cancelled() => return None,
                };
                if event.is_final {
                    drop(subscription);
                    Some((event, None))
                } else {
                    Some((event, Some((subscription, rx))))
                }
            }
        });
        stream::iter(self.prelude).chain(live)
    }
}

/// Admission, execution and status lookups for analysis jobs.
#[derive(Clone)]
pub struct AnalysisService {
    config: Arc<Config>,
    jobs: JobStore,
    cache: Arc<JobCache>,
    bus: Arc<NotificationBus>,
    artifacts: ArtifactStore,
    runner: ProcessRunner,
    tasks: TaskTracker,
}

impl AnalysisService {
    pub fn new(config: Arc<Config>, jobs: JobStore, runner: ProcessRunner, tasks: TaskTracker) -> Self {
        let cache = Arc::new(JobCache::new(Duration::from_secs(config.job_cache_ttl_seconds)));
        let artifacts = ArtifactStore::new(config.work_dir.clone());
        Self {
            config,
            jobs,
            cache,
            bus: Arc::new(NotificationBus::new()),
            artifacts,
            runner,
            tasks,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn cache(&self) -> &Arc<JobCache> {
        &self.cache
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Admits a submission and runs it. Rejections happen before anything
    /// is written or spawned.
    pub async fn submit(
        &self,
        request: AnalysisRequest,
        caller: Option<&Caller>,
        legacy: bool,
    ) -> Result<SubmitOutcome, AnalysisError> {
        let errors = request.validate();
        if !errors.is_empty() {
            return Err(AnalysisError::InvalidGeoJson(errors));
        }

        let is_async = request.analysis_options.r#async;

        if let Some(caller) = caller {
            if let Some(limit) = caller.max_concurrent_analyses {
                let running = self.jobs.count_running(&caller.owner, Utc::now()).await?;
                if running >= limit {
                    info!(owner = %caller.owner, running, limit, "Rejecting submission over concurrency limit");
                    return Err(AnalysisError::TooManyConcurrent { limit });
                }
            }
        }

        let feature_count = request.features.len();
        let geometry_limit = self.config.geometry_limit_for(is_async);
        if feature_count > geometry_limit {
            return Err(AnalysisError::TooManyGeometries {
                count: feature_count,
                limit: geometry_limit,
            });
        }

        if let Some(column) = request.analysis_options.external_id_column.as_deref() {
            if !request.has_common_property(column) {
                return Err(AnalysisError::InvalidExternalIdColumn {
                    column: column.to_string(),
                    available: request.common_property_names(),
                });
            }
        }

        let token = Uuid::new_v4().to_string();
        let now = Utc::now();
        let timeout_ms = self.config.timeout_for(is_async);
        self.cache.set(
            &token,
            JobMetadata {
                feature_count: feature_count as u64,
                start_time: now,
                percent: None,
                process_status_messages: Vec::new(),
            },
        );

        let has_row = caller.is_some();
        if let Some(caller) = caller {
            self.jobs
                .create_job(NewAnalysisJob {
                    token: token.clone(),
                    owner: caller.owner.clone(),
                    feature_count: feature_count as u64,
                    analysis_options: serde_json::to_value(&request.analysis_options).ok(),
                    timeout_ms,
                    created_at: now,
                })
                .await?;
        }

        if let Err(err) = self.persist_input(&token, &request).await {
            if has_row {
                if let Err(update_err) = self
                    .jobs
                    .finish_job(&token, JobStatus::Error, Some(format!("{err:#}")))
                    .await
                {
                    warn!(token = %token, "Failed to record input write failure: {update_err:#}");
                }
            }
            self.cache.remove(&token);
            return Err(AnalysisError::Internal(err));
        }

        if has_row {
            self.jobs
                .update_job(
                    &token,
                    JobUpdate {
                        started_at: Some(Utc::now()),
                        ..JobUpdate::default()
                    },
                )
                .await?;
        }

        info!(
            token = %token,
            owner = caller.map(|c| c.owner.as_str()).unwrap_or("anonymous"),
            feature_count,
            is_async,
            "Analysis admitted"
        );

        let continuation = self.spawn_continuation(token.clone(), has_row, timeout_ms, legacy);
        if !is_async {
            // Dropping this wait leaves the run and its recording in place.
            return match continuation.await {
                Ok(result) => result.map(SubmitOutcome::Completed),
                Err(join_err) => Err(AnalysisError::Execution(format!(
                    "analysis task aborted: {join_err}"
                ))),
            };
        }

        drop(continuation);
        Ok(SubmitOutcome::Accepted(AcceptedResponse {
            status_url: format!("/api/status/{token}"),
            token,
            feature_count: feature_count as u64,
        }))
    }

    async fn persist_input(&self, token: &str, request: &AnalysisRequest) -> anyhow::Result<()> {
        self.artifacts.ensure_root().await?;
        self.artifacts.write_input(token, request).await
    }

    /// Runs the job on the tracker for both modes, so the terminal state is
    /// recorded even if the submitting request goes away. The inner task is
    /// joined so a panic in the run still ends in a recorded terminal state.
    fn spawn_continuation(
        &self,
        token: String,
        has_row: bool,
        timeout_ms: u64,
        legacy: bool,
    ) -> JoinHandle<Result<Value, AnalysisError>> {
        let service = self.clone();
        self.tasks.spawn(async move {
            let worker = {
                let service = service.clone();
                let token = token.clone();
                tokio::spawn(async move { service.execute(&token, timeout_ms, legacy).await })
            };
            let result = match worker.await {
                Ok(result) => result,
                Err(join_err) => {
                    error!(token = %token, "Analysis task aborted: {join_err}");
                    Err(AnalysisError::Execution(format!(
                        "analysis task aborted: {join_err}"
                    )))
                }
            };
            let outcome = service.complete(&token, has_row, result).await;
            if let Err(err) = &outcome {
                debug!(token = %token, "Analysis ended with an error: {err}");
            }
            outcome
        })
    }

    async fn execute(&self, token: &str, timeout_ms: u64, legacy: bool) -> Result<Value, AnalysisError> {
        let request = RunRequest {
            token: token.to_string(),
            input_path: self.artifacts.input_path(token),
            output_path: self.artifacts.output_path(token),
            timeout: Duration::from_millis(timeout_ms),
            legacy,
        };

        let cache = self.cache.clone();
        let bus = self.bus.clone();
        let line_token = token.to_string();
        let outcome = self
            .runner
            .run(&request, move |line| {
                if cache.record_output(&line_token, line) {
                    let data = cache
                        .get(&line_token)
                        .and_then(|metadata| serde_json::to_value(metadata).ok());
                    bus.emit(&line_token, &StatusEvent::progress(data));
                }
            })
            .await;

        match outcome {
            Ok(_) => {}
            Err(RunError::Timeout { timeout_ms }) => {
                return Err(AnalysisError::Timeout { timeout_ms });
            }
            Err(err) => return Err(AnalysisError::Execution(err.to_string())),
        }

        let output = read_json::<Value>(&request.output_path).await?;
        if let Err(err) = delete_file_if_exists(&request.output_path).await {
            warn!(token = %token, "Failed to remove staging output: {err:#}");
        }
        output.ok_or_else(|| {
            AnalysisError::Execution("analysis finished without writing an output file".to_string())
        })
    }

    /// The only writer of terminal state: result or error artifact, the
    /// durable row and the final bus event. Each step runs even when an
    /// earlier one fails.
    async fn complete(
        &self,
        token: &str,
        has_row: bool,
        result: Result<Value, AnalysisError>,
    ) -> Result<Value, AnalysisError> {
        let result = match result {
            Ok(value) => match self.artifacts.write_result(token, &value).await {
                Ok(()) => Ok(value),
                Err(err) => Err(AnalysisError::Internal(err)),
            },
            Err(err) => Err(err),
        };

        let (status, reply, error_message) = match &result {
            Ok(value) => (
                JobStatus::Completed,
                StatusReply::new(SystemCode::AnalysisCompleted, Some(value.clone())),
                None,
            ),
            Err(err) => {
                let artifact = err.to_artifact();
                if let Err(write_err) = self.artifacts.write_error(token, &artifact).await {
                    error!(token = %token, "Failed to write error artifact: {write_err:#}");
                }
                let status = match err {
                    AnalysisError::Timeout { .. } => JobStatus::Timeout,
                    _ => JobStatus::Error,
                };
                (status, artifact.to_reply(), Some(err.to_string()))
            }
        };

        if has_row {
            match self.jobs.finish_job(token, status, error_message).await {
                Ok(true) => {}
                Ok(false) => warn!(token = %token, "Job row was already terminal"),
                Err(err) => error!(token = %token, "Failed to record terminal status: {err:#}"),
            }
        }

        let delivered = self.bus.emit(token, &StatusEvent::terminal(reply));
        info!(token = %token, status = status.as_str(), delivered, "Analysis finished");
        result
    }

    /// File-based lookup: result, then error, then input. Unknown and
    /// malformed tokens are "not found".
    pub async fn status(&self, token: &str) -> Result<StatusReply, AnalysisError> {
        if !is_valid_token(token) {
            return Ok(StatusReply::new(SystemCode::AnalysisJobNotFound, None));
        }
        if let Some(result) = self.artifacts.read_result(token).await? {
            return Ok(StatusReply::new(SystemCode::AnalysisCompleted, Some(result)));
        }
        if let Some(artifact) = self.artifacts.read_error(token).await? {
            return Ok(artifact.to_reply());
        }
        if self.artifacts.has_input(token).await {
            let metadata = self
                .cache
                .get(token)
                .and_then(|metadata| serde_json::to_value(metadata).ok());
            return Ok(StatusReply::new(SystemCode::AnalysisProcessing, metadata));
        }
        Ok(StatusReply::new(SystemCode::AnalysisJobNotFound, None))
    }

    /// Subscribes before looking at the files, so a job finishing in
    /// between is seen either on disk or on the bus.
    pub async fn stream_events(&self, token: &str) -> Result<StatusStream, AnalysisError> {
        let (subscription, rx) = self.bus.subscribe_channel(token);
        let reply = self.status(token).await?;
        let max_duration = self.stream_max_duration();
        let shutdown = self.runner.shutdown_token().clone();

        if reply.code.is_terminal() {
            return Ok(StatusStream {
                prelude: vec![StatusEvent::terminal(reply)],
                live: None,
                max_duration,
                shutdown,
            });
        }

        let prelude = match reply.data {
            Some(data) => vec![StatusEvent::progress(Some(data))],
            None => Vec::new(),
        };
        Ok(StatusStream {
            prelude,
            live: Some((subscription, rx)),
            max_duration,
            shutdown,
        })
    }

    /// Longest a job admitted now could run before its terminal event.
    fn stream_max_duration(&self) -> Duration {
        let budget = self.config.timeout_ms.max(self.config.timeout_sync_ms);
        Duration::from_millis(budget + self.config.kill_grace_ms)
    }

    pub async fn stats(&self, owner: &str) -> Result<JobStats, AnalysisError> {
        let mut stats = self
            .jobs
            .stats(owner, Utc::now(), self.config.recent_jobs)
            .await?;
        for job in &mut stats.recent_jobs {
            job.results_available = self.artifacts.results_available(&job.token).await;
        }
        Ok(stats)
    }
}
