//! Subprocess execution with cancellation and deadlines.
//!
//! Shared by the Docker sandbox, the CLI planner and host verification.
//! The child is killed when the token is cancelled or the deadline passes;
//! stdout/stderr are captured with a size cap either way.

use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between progress logs for long-running children.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Grace period for draining pipes after the child exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes kept from each of stdout and stderr.
pub const MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("{program} not found")]
    NotFound { program: String },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Captured result of a finished child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr separated by a blank line; stderr omitted when empty.
    pub fn combined(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n\n{}", self.stdout.trim_end_matches('\n'), self.stderr)
        }
    }
}

/// How the wait loop ended.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Read from an async reader, keeping at most `max_bytes`.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "output exceeded limit, truncating");
            // Keep draining so the child never blocks on a full pipe.
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        let to_take = n.min(remaining);
        buf.extend_from_slice(&chunk[..to_take]);
    }

    Ok(buf)
}

async fn collect(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
    stream: &'static str,
) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(stream, error = %err, "output capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(stream, error = %err, "output capture task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!(stream, "output capture timed out");
            Vec::new()
        }
    }
}

/// Run `cmd` to completion, feeding `stdin` if given.
///
/// A non-zero exit is not an error here; callers inspect `exit_code`.
pub async fn run(
    mut cmd: Command,
    stdin: Option<String>,
    deadline: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<ProcessOutput> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    if cancel.is_cancelled() {
        return Err(ProcessError::Cancelled);
    }

    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    debug!(program = %program, "spawning process");
    let mut child = cmd.spawn().map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ProcessError::NotFound {
                program: program.clone(),
            }
        } else {
            ProcessError::Spawn {
                program: program.clone(),
                source,
            }
        }
    })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(err) = pipe.write_all(input.as_bytes()).await {
                debug!(error = %err, "stdin write failed");
            }
            // Dropping the pipe closes stdin so the child sees EOF.
        });
    }

    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(read_bounded(out, MAX_OUTPUT_BYTES)));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(read_bounded(err, MAX_OUTPUT_BYTES)));

    let started = Instant::now();
    let outcome = loop {
        let elapsed = started.elapsed();
        let remaining = match deadline {
            Some(limit) if elapsed >= limit => {
                warn!(program = %program, timeout_sec = limit.as_secs(), "process timed out; killing");
                if let Err(err) = child.kill().await {
                    warn!(program = %program, error = %err, "failed to kill timed-out process");
                }
                let _ = child.wait().await;
                break ProcessOutcome::TimedOut;
            }
            Some(limit) => limit.saturating_sub(elapsed),
            None => Duration::MAX,
        };

        tokio::select! {
            result = child.wait() => break ProcessOutcome::Completed(result?),
            () = cancel.cancelled() => {
                info!(program = %program, "cancellation requested; killing process");
                if let Err(err) = child.kill().await {
                    warn!(program = %program, error = %err, "failed to kill cancelled process");
                }
                let _ = child.wait().await;
                break ProcessOutcome::Cancelled;
            }
            () = tokio::time::sleep(HEARTBEAT_INTERVAL.min(remaining)) => {
                debug!(
                    program = %program,
                    elapsed_sec = started.elapsed().as_secs(),
                    "process still running"
                );
            }
        }
    };

    let stdout = collect(stdout_task, "stdout").await;
    let stderr = collect(stderr_task, "stderr").await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        ProcessOutcome::TimedOut => Err(ProcessError::Timeout(deadline.unwrap_or_default())),
        ProcessOutcome::Cancelled => Err(ProcessError::Cancelled),
        ProcessOutcome::Completed(status) => Ok(ProcessOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration_ms,
        }),
    }
}

/// Shorten `s` for log lines and summaries, on a char boundary.
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
