use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    codes::SystemCode,
    models::{StatusEvent, StatusReply},
};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("invalid status payload: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}

pub type EventStream = BoxStream<'static, Result<StatusEvent, TransportError>>;

/// Both ways of asking the server about a job.
#[async_trait]
pub trait StatusTransport: Send + Sync {
    async fn open_stream(&self, token: &str) -> Result<EventStream, TransportError>;
    async fn poll(&self, token: &str) -> Result<StatusReply, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    poll_timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            poll_timeout: Duration::from_secs(15),
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => request.header("x-api-key", key),
            None => request,
        }
    }
}

#[async_trait]
impl StatusTransport for HttpTransport {
    async fn open_stream(&self, token: &str) -> Result<EventStream, TransportError> {
        let response = self
            .get(&format!("/api/status/{token}/stream"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        let bytes = response.bytes_stream().boxed();
        let events = futures::stream::unfold(
            (bytes, SseDecoder::default(), VecDeque::new()),
            |(mut bytes, mut decoder, mut queue)| async move {
                loop {
                    if let Some(item) = queue.pop_front() {
                        return Some((item, (bytes, decoder, queue)));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => queue.extend(decoder.push(&chunk)),
                        Some(Err(err)) => {
                            return Some((
                                Err(TransportError::Request(err.to_string())),
                                (bytes, decoder, queue),
                            ))
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(events.boxed())
    }

    async fn poll(&self, token: &str) -> Result<StatusReply, TransportError> {
        let response = self
            .get(&format!("/api/status/{token}"))
            .timeout(self.poll_timeout)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        // Terminal failures come back as 4xx/5xx with a regular reply body.
        match serde_json::from_slice::<StatusReply>(&body) {
            Ok(reply) => Ok(reply),
            Err(err) if status.is_success() => Err(TransportError::Decode(err.to_string())),
            Err(_) => Err(TransportError::Status(status.as_u16())),
        }
    }
}

/// Incremental `text/event-stream` parser that yields one status event per
/// blank-line-terminated block of `data:` lines.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<StatusEvent, TransportError>> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    let payload = self.data.join("\n");
                    self.data.clear();
                    events.push(
                        serde_json::from_str::<StatusEvent>(&payload)
                            .map_err(|err| TransportError::Decode(err.to_string())),
                    );
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // Comments, `event:`, `id:` and `retry:` lines carry nothing we use.
        }
        events
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub idle_timeout: Duration,
    pub max_stream_duration: Duration,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub max_poll_failures: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            max_stream_duration: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            max_poll_interval: Duration::from_secs(30),
            max_poll_failures: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverPhase {
    AwaitingPush,
    FallbackPolling,
    Finished,
}

/// Latest view of a job as seen by the resolver, whichever channel it
/// came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverStatus {
    pub phase: ResolverPhase,
    pub reply: Option<StatusReply>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Terminal(StatusReply),
    Failed(String),
}

type CompletionCallback = Box<dyn FnOnce(&Resolution) + Send>;

/// First caller of [`CompletionLatch::fire`] runs the callback; everyone
/// after that is ignored.
pub struct CompletionLatch {
    fired: AtomicBool,
    callback: Mutex<Option<CompletionCallback>>,
}

impl CompletionLatch {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(&Resolution) + Send + 'static,
    {
        Self {
            fired: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }

    pub fn fire(&self, resolution: &Resolution) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(callback) = self.callback.lock().take() {
            callback(resolution);
        }
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
enum PushAbort {
    Open(TransportError),
    Transport(TransportError),
    Idle,
    MaxDuration,
    Closed,
}

impl std::fmt::Display for PushAbort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(err) => write!(f, "stream open failed: {err}"),
            Self::Transport(err) => write!(f, "stream error: {err}"),
            Self::Idle => f.write_str("no stream data within idle timeout"),
            Self::MaxDuration => f.write_str("stream exceeded maximum duration"),
            Self::Closed => f.write_str("stream closed before a final event"),
        }
    }
}

enum PollVerdict {
    Pending,
    Terminal,
    Failure,
}

fn classify(reply: &StatusReply) -> PollVerdict {
    match reply.code {
        SystemCode::AnalysisProcessing => PollVerdict::Pending,
        SystemCode::AnalysisCompleted
        | SystemCode::AnalysisError
        | SystemCode::AnalysisTimeout
        | SystemCode::AnalysisJobNotFound => PollVerdict::Terminal,
        _ => PollVerdict::Failure,
    }
}

/// Follows one job to a terminal status: push stream first, polling with
/// backoff once the stream is abandoned.
pub struct StatusResolver<T> {
    transport: Arc<T>,
    config: ResolverConfig,
    status_tx: watch::Sender<ResolverStatus>,
}

impl<T: StatusTransport> StatusResolver<T> {
    pub fn new(transport: Arc<T>, config: ResolverConfig) -> Self {
        let (status_tx, _) = watch::channel(ResolverStatus {
            phase: ResolverPhase::AwaitingPush,
            reply: None,
            error: None,
        });
        Self {
            transport,
            config,
            status_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ResolverStatus> {
        self.status_tx.subscribe()
    }

    /// Resolves `token`; `on_complete` runs exactly once with the outcome.
    pub async fn resolve<F>(&self, token: &str, on_complete: F) -> Resolution
    where
        F: FnOnce(&Resolution) + Send + 'static,
    {
        let latch = CompletionLatch::new(on_complete);
        self.set_phase(ResolverPhase::AwaitingPush);

        let resolution = match self.await_push(token).await {
            Ok(reply) => Resolution::Terminal(reply),
            Err(abort) => {
                info!(token = %token, reason = %abort, "Falling back to status polling");
                self.status_tx.send_modify(|status| {
                    status.phase = ResolverPhase::FallbackPolling;
                    status.error = Some(abort.to_string());
                });
                self.poll_until_terminal(token).await
            }
        };

        latch.fire(&resolution);
        self.status_tx.send_modify(|status| {
            status.phase = ResolverPhase::Finished;
            match &resolution {
                Resolution::Terminal(reply) => {
                    status.reply = Some(reply.clone());
                    status.error = None;
                }
                Resolution::Failed(reason) => status.error = Some(reason.clone()),
            }
        });
        resolution
    }

    /// Returns the terminal reply or why the stream was given up. The stream
    /// is dropped on return, before any polling starts.
    async fn await_push(&self, token: &str) -> Result<StatusReply, PushAbort> {
        let max_duration = sleep(self.config.max_stream_duration);
        tokio::pin!(max_duration);

        let mut stream = tokio::select! {
            _ = &mut max_duration => return Err(PushAbort::MaxDuration),
            opened = timeout(self.config.idle_timeout, self.transport.open_stream(token)) => match opened {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => return Err(PushAbort::Open(err)),
                Err(_) => return Err(PushAbort::Idle),
            },
        };

        loop {
            let next = tokio::select! {
                _ = &mut max_duration => return Err(PushAbort::MaxDuration),
                next = timeout(self.config.idle_timeout, stream.next()) => next,
            };
            match next {
                Err(_) => return Err(PushAbort::Idle),
                Ok(None) => return Err(PushAbort::Closed),
                Ok(Some(Err(err))) => return Err(PushAbort::Transport(err)),
                Ok(Some(Ok(event))) => {
                    let is_final = event.is_final;
                    let reply = event.into_reply();
                    debug!(token = %token, code = %reply.code, is_final, "Status event");
                    if is_final {
                        return Ok(reply);
                    }
                    self.status_tx.send_modify(|status| status.reply = Some(reply));
                }
            }
        }
    }

    async fn poll_until_terminal(&self, token: &str) -> Resolution {
        let mut delay = self.config.poll_interval;
        let mut failures = 0u32;
        loop {
            let failure = match self.transport.poll(token).await {
                Ok(reply) => match classify(&reply) {
                    PollVerdict::Terminal => return Resolution::Terminal(reply),
                    PollVerdict::Pending => {
                        failures = 0;
                        delay = self.config.poll_interval;
                        self.status_tx.send_modify(|status| {
                            status.reply = Some(reply);
                            status.error = None;
                        });
                        None
                    }
                    PollVerdict::Failure => Some(format!("{}: {}", reply.code, reply.message)),
                },
                Err(err) => Some(err.to_string()),
            };

            if let Some(reason) = failure {
                failures += 1;
                warn!(token = %token, failures, "Status poll failed: {reason}");
                if failures > self.config.max_poll_failures {
                    return Resolution::Failed(format!(
                        "status polling failed {failures} times in a row: {reason}"
                    ));
                }
                delay = (delay * 2).min(self.config.max_poll_interval);
                self.status_tx
                    .send_modify(|status| status.error = Some(reason));
            }
            sleep(delay).await;
        }
    }

    fn set_phase(&self, phase: ResolverPhase) {
        self.status_tx.send_modify(|status| status.phase = phase);
    }
}

#[derive(Debug, PartialEq)]
struct WatchArgs {
    token: String,
    base_url: String,
    api_key: Option<String>,
}

/// Handles `watch <token> [--base-url URL] [--api-key KEY]`; returns false
/// when the arguments are for some other mode.
pub async fn maybe_run_from_cli(args: &[String]) -> anyhow::Result<bool> {
    if args.len() < 2 || args[1] != "watch" {
        return Ok(false);
    }

    let parsed = parse_watch_args(args)?;
    let transport = Arc::new(HttpTransport::new(parsed.base_url.clone(), parsed.api_key)?);
    let resolver = StatusResolver::new(transport, ResolverConfig::default());
    let mut updates = resolver.subscribe();
    let token = parsed.token.clone();
    let progress = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let status = updates.borrow_and_update().clone();
            if let Some(reply) = &status.reply {
                info!(token = %token, phase = ?status.phase, code = %reply.code, "Status update");
            }
        }
    });

    let resolution = resolver.resolve(&parsed.token, |_| {}).await;
    progress.abort();
    match resolution {
        Resolution::Terminal(reply) => {
            println!("{}", serde_json::to_string_pretty(&reply)?);
            Ok(true)
        }
        Resolution::Failed(reason) => anyhow::bail!("Could not resolve {}: {reason}", parsed.token),
    }
}

fn parse_watch_args(args: &[String]) -> anyhow::Result<WatchArgs> {
    let mut token = None;
    let mut base_url = None;
    let mut api_key = None;

    let mut i = 2usize;
    while i < args.len() {
        let key = args[i].as_str();
        let val = args.get(i + 1).cloned();
        match (key, val) {
            ("--base-url", Some(v)) => {
                base_url = Some(v);
                i += 2;
            }
            ("--api-key", Some(v)) => {
                api_key = Some(v);
                i += 2;
            }
            (positional, _) if !positional.starts_with("--") && token.is_none() => {
                token = Some(positional.to_string());
                i += 1;
            }
            _ => anyhow::bail!("Unknown or incomplete argument near `{key}`"),
        }
    }

    let token = token.ok_or_else(|| anyhow::anyhow!("watch requires a job token"))?;
    Ok(WatchArgs {
        token,
        base_url: base_url.unwrap_or_else(|| "http://127.0.0.1:8080".to_string()),
        api_key: api_key.or_else(|| std::env::var("ANALYSIS_API_KEY").ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    type ScriptedEvent = (Duration, Result<StatusEvent, TransportError>);

    struct MockTransport {
        stream: Mutex<Option<Result<Vec<ScriptedEvent>, TransportError>>>,
        hang_after_script: bool,
        polls: Mutex<VecDeque<Result<StatusReply, TransportError>>>,
        poll_times: Mutex<Vec<Instant>>,
        opened: AtomicUsize,
    }

    impl MockTransport {
        fn new(
            stream: Result<Vec<ScriptedEvent>, TransportError>,
            hang_after_script: bool,
            polls: Vec<Result<StatusReply, TransportError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                stream: Mutex::new(Some(stream)),
                hang_after_script,
                polls: Mutex::new(polls.into()),
                poll_times: Mutex::new(Vec::new()),
                opened: AtomicUsize::new(0),
            })
        }

        fn poll_count(&self) -> usize {
            self.poll_times.lock().len()
        }
    }

    #[async_trait]
    impl StatusTransport for MockTransport {
        async fn open_stream(&self, _token: &str) -> Result<EventStream, TransportError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let script = self
                .stream
                .lock()
                .take()
                .unwrap_or_else(|| Err(TransportError::Status(503)))?;
            let events = stream::iter(script).then(|(delay, item)| async move {
                sleep(delay).await;
                item
            });
            if self.hang_after_script {
                Ok(events.chain(stream::pending()).boxed())
            } else {
                Ok(events.boxed())
            }
        }

        async fn poll(&self, _token: &str) -> Result<StatusReply, TransportError> {
            self.poll_times.lock().push(Instant::now());
            self.polls
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Request("connection refused".into())))
        }
    }

    fn completed() -> StatusReply {
        StatusReply::new(SystemCode::AnalysisCompleted, Some(json!({ "area": 3.5 })))
    }

    fn processing() -> StatusReply {
        StatusReply::new(SystemCode::AnalysisProcessing, None)
    }

    fn counting_callback() -> (Arc<AtomicUsize>, Arc<Mutex<Option<Resolution>>>, impl FnOnce(&Resolution) + Send + 'static) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        let (calls_in, seen_in) = (calls.clone(), seen.clone());
        let callback = move |resolution: &Resolution| {
            calls_in.fetch_add(1, Ordering::SeqCst);
            *seen_in.lock() = Some(resolution.clone());
        };
        (calls, seen, callback)
    }

    #[tokio::test(start_paused = true)]
    async fn final_push_event_resolves_without_polling() {
        let transport = MockTransport::new(
            Ok(vec![
                (Duration::from_secs(1), Ok(StatusEvent::progress(None))),
                (Duration::from_secs(1), Ok(StatusEvent::terminal(completed()))),
            ]),
            true,
            Vec::new(),
        );
        let resolver = StatusResolver::new(transport.clone(), ResolverConfig::default());
        let (calls, _, callback) = counting_callback();

        let resolution = resolver.resolve("tok", callback).await;
        assert_eq!(resolution, Resolution::Terminal(completed()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.poll_count(), 0);
        assert_eq!(resolver.subscribe().borrow().phase, ResolverPhase::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_falls_back_and_fires_callback_once() {
        let transport = MockTransport::new(
            Ok(vec![(
                Duration::from_secs(2),
                Err(TransportError::Request("connection reset".into())),
            )]),
            false,
            vec![
                Err(TransportError::Status(502)),
                Err(TransportError::Status(502)),
                Ok(completed()),
            ],
        );
        let resolver = StatusResolver::new(transport.clone(), ResolverConfig::default());
        let (calls, seen, callback) = counting_callback();

        let resolution = resolver.resolve("tok", callback).await;
        assert_eq!(resolution, Resolution::Terminal(completed()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), Some(Resolution::Terminal(completed())));
        assert_eq!(transport.poll_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_stream_hits_idle_timeout() {
        let transport = MockTransport::new(Ok(Vec::new()), true, vec![Ok(completed())]);
        let resolver = StatusResolver::new(transport.clone(), ResolverConfig::default());

        let started = Instant::now();
        let resolution = resolver.resolve("tok", |_| {}).await;
        assert_eq!(resolution, Resolution::Terminal(completed()));
        let first_poll = transport.poll_times.lock()[0];
        assert_eq!(first_poll - started, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn chatty_stream_is_cut_at_max_duration() {
        let heartbeat: Vec<ScriptedEvent> = (0..100)
            .map(|_| (Duration::from_secs(5), Ok(StatusEvent::progress(None))))
            .collect();
        let transport = MockTransport::new(Ok(heartbeat), true, vec![Ok(completed())]);
        let resolver = StatusResolver::new(transport.clone(), ResolverConfig::default());

        let started = Instant::now();
        resolver.resolve("tok", |_| {}).await;
        let first_poll = transport.poll_times.lock()[0];
        assert_eq!(first_poll - started, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_on_failure_and_resets_on_success() {
        let transport = MockTransport::new(
            Err(TransportError::Status(404)),
            false,
            vec![
                Err(TransportError::Status(500)),
                Ok(processing()),
                Err(TransportError::Status(500)),
                Ok(completed()),
            ],
        );
        let resolver = StatusResolver::new(transport.clone(), ResolverConfig::default());
        resolver.resolve("tok", |_| {}).await;

        let times = transport.poll_times.lock().clone();
        let offsets: Vec<u64> = times.iter().map(|t| (*t - times[0]).as_secs()).collect();
        assert_eq!(offsets, vec![0, 4, 6, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_polling_is_a_permanent_failure() {
        let transport = MockTransport::new(Err(TransportError::Status(503)), false, Vec::new());
        let resolver = StatusResolver::new(transport.clone(), ResolverConfig::default());
        let (calls, seen, callback) = counting_callback();

        let resolution = resolver.resolve("tok", callback).await;
        assert!(matches!(resolution, Resolution::Failed(_)));
        assert_eq!(transport.poll_count(), 6);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(*seen.lock(), Some(Resolution::Failed(_))));
        let status = resolver.subscribe().borrow().clone();
        assert_eq!(status.phase, ResolverPhase::Finished);
        assert!(status.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn processing_replies_keep_polling_and_update_status() {
        let transport = MockTransport::new(
            Err(TransportError::Status(503)),
            false,
            vec![Ok(processing()), Ok(processing()), Ok(completed())],
        );
        let resolver = StatusResolver::new(transport.clone(), ResolverConfig::default());
        let mut rx = resolver.subscribe();

        let resolution = resolver.resolve("tok", |_| {}).await;
        assert_eq!(resolution, Resolution::Terminal(completed()));
        assert!(rx.has_changed().expect("sender alive"));
        let status = rx.borrow_and_update().clone();
        assert_eq!(status.reply, Some(completed()));
        assert_eq!(status.error, None);
    }

    #[test]
    fn latch_runs_callback_only_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let latch = CompletionLatch::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        assert!(latch.fire(&Resolution::Terminal(completed())));
        assert!(!latch.fire(&Resolution::Failed("late".into())));
        assert!(latch.has_fired());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn decoder_handles_split_chunks_and_comments() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b": keep-alive\n\ndata: {\"code\":\"analysis_proc").is_empty());
        let events = decoder.push(b"essing\"}\n\ndata: {\"code\":\"analysis_completed\",\"final\":true}\r\n\r\n");
        assert_eq!(events.len(), 2);
        let first = events[0].as_ref().expect("first");
        assert_eq!(first.code, SystemCode::AnalysisProcessing);
        assert!(!first.is_final);
        let second = events[1].as_ref().expect("second");
        assert!(second.is_final);
    }

    #[test]
    fn decoder_reports_bad_payloads() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"data: not-json\n\n");
        assert!(matches!(events[0], Err(TransportError::Decode(_))));
    }

    #[test]
    fn watch_args_parse_token_and_flags() {
        let args: Vec<String> = ["bin", "watch", "abc-123", "--base-url", "http://host:9000"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let parsed = parse_watch_args(&args).expect("parse");
        assert_eq!(parsed.token, "abc-123");
        assert_eq!(parsed.base_url, "http://host:9000");

        let missing: Vec<String> = ["bin", "watch"].iter().map(|s| s.to_string()).collect();
        assert!(parse_watch_args(&missing).is_err());
        let dangling: Vec<String> = ["bin", "watch", "tok", "--base-url"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(parse_watch_args(&dangling).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn http_transport_follows_a_live_server() {
        use crate::{config::Config, job_store::JobStore, AppState};
        use tokio_util::{sync::CancellationToken, task::TaskTracker};

        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            work_dir: dir.path().to_path_buf(),
            program: "sh".to_string(),
            program_args: vec![
                "-c".to_string(),
                r#"sleep 0.2; printf '{"area":3.5}' > "$2""#.to_string(),
                "analysis".to_string(),
            ],
            ..Config::default()
        };
        let state = AppState::new(
            Arc::new(config),
            JobStore::open_in_memory().expect("store"),
            CancellationToken::new(),
            TaskTracker::new(),
        );
        let analysis = state.analysis.clone();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, crate::api::router(state)).await;
        });

        let request = serde_json::from_value(json!({
            "type": "FeatureCollection",
            "features": [{ "type": "Feature", "geometry": { "type": "Point", "coordinates": [0, 0] }, "properties": {} }],
            "analysisOptions": { "async": true }
        }))
        .expect("request");
        let token = match analysis.submit(request, None, false).await.expect("submit") {
            crate::analysis::SubmitOutcome::Accepted(accepted) => accepted.token,
            other => panic!("unexpected outcome {other:?}"),
        };

        let transport = Arc::new(HttpTransport::new(format!("http://{addr}"), None).expect("client"));
        let resolver = StatusResolver::new(transport, ResolverConfig::default());
        let resolution = timeout(Duration::from_secs(10), resolver.resolve(&token, |_| {}))
            .await
            .expect("resolved in time");
        match resolution {
            Resolution::Terminal(reply) => {
                assert_eq!(reply.code, SystemCode::AnalysisCompleted);
                assert_eq!(reply.data, Some(json!({ "area": 3.5 })));
            }
            other => panic!("unexpected resolution {other:?}"),
        }
    }
}
