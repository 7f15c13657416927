use std::{
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, Lines},
    process::{Child, ChildStdout, Command},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Per-stream capture ceiling. Output past it is still read, just not kept.
const MAX_CAPTURE_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("analysis process exited with {}: {stderr}", exit_label(.code))]
    Exit { code: Option<i32>, stderr: String },
    #[error("analysis process timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("analysis process stopped by shutdown")]
    Shutdown,
    #[error("failed waiting for analysis process: {0}")]
    Io(#[from] io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub token: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub timeout: Duration,
    pub legacy: bool,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
    Shutdown,
}

/// Runs the external analysis program once per job. The program is invoked as
/// `program [args..] <input> <output> [legacy]` in its own process group so a
/// timeout or shutdown can signal everything it started.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
    kill_grace: Duration,
    shutdown: CancellationToken,
}

impl ProcessRunner {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        kill_grace: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            kill_grace,
            shutdown,
        }
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn from_config(config: &Config, shutdown: CancellationToken) -> Self {
        Self::new(
            config.program.clone(),
            config.program_args.clone(),
            Duration::from_millis(config.kill_grace_ms),
            shutdown,
        )
    }

    /// Runs to completion, calling `on_line` for each stdout line as it
    /// arrives. Timeout and shutdown both go through SIGTERM, then SIGKILL
    /// once the grace period is spent.
    pub async fn run<F>(&self, request: &RunRequest, mut on_line: F) -> Result<RunOutput, RunError>
    where
        F: FnMut(&str) + Send,
    {
        if self.shutdown.is_cancelled() {
            return Err(RunError::Shutdown);
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&request.input_path)
            .arg(&request.output_path);
        if request.legacy {
            command.arg("legacy");
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| RunError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let mut group = GroupGuard::new(child.id());
        info!(
            token = %request.token,
            pid = child.id(),
            timeout_ms = request.timeout.as_millis() as u64,
            "Started analysis process"
        );

        let mut stdout_lines = child.stdout.take().map(|out| BufReader::new(out).lines());
        let stderr_task = spawn_capture(child.stderr.take());
        let mut stdout = String::new();

        let deadline = sleep(request.timeout);
        tokio::pin!(deadline);
        let mut stdout_open = stdout_lines.is_some();

        let outcome = loop {
            tokio::select! {
                line = next_line(&mut stdout_lines), if stdout_open => match line {
                    Ok(Some(line)) => {
                        on_line(&line);
                        push_capped(&mut stdout, &line);
                    }
                    Ok(None) => stdout_open = false,
                    Err(err) => {
                        debug!(token = %request.token, "Stopped reading stdout: {err}");
                        stdout_open = false;
                    }
                },
                status = child.wait() => break Outcome::Exited(status?),
                _ = &mut deadline => break Outcome::TimedOut,
                _ = self.shutdown.cancelled() => break Outcome::Shutdown,
            }
        };

        let result = match outcome {
            Outcome::Exited(status) => {
                if stdout_open {
                    self.drain_lines(&mut stdout_lines, &mut stdout, &mut on_line)
                        .await;
                }
                let stderr = self.collect_stderr(stderr_task).await;
                let elapsed = started.elapsed();
                if status.success() {
                    debug!(
                        token = %request.token,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Analysis process finished"
                    );
                    Ok(RunOutput {
                        stdout,
                        stderr,
                        elapsed,
                    })
                } else {
                    warn!(token = %request.token, status = %status, "Analysis process failed");
                    Err(RunError::Exit {
                        code: status.code(),
                        stderr: stderr.trim().to_string(),
                    })
                }
            }
            Outcome::TimedOut => {
                warn!(
                    token = %request.token,
                    timeout_ms = request.timeout.as_millis() as u64,
                    "Analysis process timed out, terminating"
                );
                self.terminate(&mut child, &request.token).await;
                stderr_task.abort();
                Err(RunError::Timeout {
                    timeout_ms: request.timeout.as_millis() as u64,
                })
            }
            Outcome::Shutdown => {
                info!(token = %request.token, "Shutdown requested, terminating analysis process");
                self.terminate(&mut child, &request.token).await;
                stderr_task.abort();
                Err(RunError::Shutdown)
            }
        };
        group.disarm();
        result
    }

    async fn terminate(&self, child: &mut Child, token: &str) {
        let pid = child.id();
        signal_group(pid, GroupSignal::Terminate);
        #[cfg(not(unix))]
        let _ = child.start_kill();

        if timeout(self.kill_grace, child.wait()).await.is_err() {
            warn!(token = %token, "Process ignored SIGTERM, sending SIGKILL");
            if let Err(err) = child.start_kill() {
                debug!(token = %token, "start_kill failed: {err}");
            }
            if let Err(err) = child.wait().await {
                warn!(token = %token, "Failed to reap killed process: {err}");
            }
        }
        // Anything the program left behind in its group goes too.
        signal_group(pid, GroupSignal::Kill);
    }

    async fn drain_lines<F>(
        &self,
        lines: &mut Option<Lines<BufReader<ChildStdout>>>,
        stdout: &mut String,
        on_line: &mut F,
    ) where
        F: FnMut(&str) + Send,
    {
        let drain = async {
            while let Ok(Some(line)) = next_line(lines).await {
                on_line(&line);
                push_capped(stdout, &line);
            }
        };
        if timeout(self.kill_grace, drain).await.is_err() {
            debug!("Stdout still open after exit; leaving remaining output unread");
        }
    }

    async fn collect_stderr(&self, mut task: JoinHandle<String>) -> String {
        match timeout(self.kill_grace, &mut task).await {
            Ok(Ok(stderr)) => stderr,
            Ok(Err(err)) => {
                debug!("stderr reader failed: {err}");
                String::new()
            }
            Err(_) => {
                task.abort();
                String::new()
            }
        }
    }
}

async fn next_line(
    lines: &mut Option<Lines<BufReader<ChildStdout>>>,
) -> io::Result<Option<String>> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => Ok(None),
    }
}

fn spawn_capture<R>(reader: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(reader) = reader else {
            return String::new();
        };
        let mut reader = reader;
        let mut kept = Vec::new();
        let mut chunk = [0u8; 8192];
        // Read to EOF so a chatty program never hits a closed pipe.
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(read) => {
                    let room = MAX_CAPTURE_BYTES.saturating_sub(kept.len());
                    kept.extend_from_slice(&chunk[..read.min(room)]);
                }
                Err(err) => {
                    debug!("Failed reading stderr: {err}");
                    break;
                }
            }
        }
        String::from_utf8_lossy(&kept).into_owned()
    })
}

fn push_capped(buf: &mut String, line: &str) {
    if buf.len() + line.len() < MAX_CAPTURE_BYTES {
        buf.push_str(line);
        buf.push('\n');
    }
}

/// Kills the whole process group if `run` is dropped before the child was
/// reaped. `kill_on_drop` alone only reaches the direct child.
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.pid.is_some() {
            signal_group(self.pid, GroupSignal::Kill);
        }
    }
}

#[derive(Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GroupSignal) {
    use nix::{
        errno::Errno,
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => warn!(pid, %errno, "Failed to send {signal} to process group"),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GroupSignal) {}
