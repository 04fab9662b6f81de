//! Worker executor: one sandbox per task.
//!
//! `start` acquires the sandbox, `run_worker` translates planner worker
//! calls into sandbox execs, `stop` releases it. Exec failures are captured
//! in the returned `WorkerRunResult` instead of being raised.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use runner_core::config::{absolutize, WorkerConfig};
use runner_core::{WorkerCall, WorkerRunResult};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::process::truncate_str;
use crate::sandbox::{SandboxError, SandboxProvider, SandboxSpec};
use crate::worker_tools::{build_invocation, WorkerToolError};

/// Prefix marking an env value to be read from the host.
pub const HOST_ENV_PREFIX: &str = "env:";

const SUMMARY_MAX_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("container already started: {0}")]
    AlreadyStarted(String),
    #[error("failed to resolve repository path {path}: {source}")]
    RepoPath {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to start container: {0}")]
    StartFailed(#[source] SandboxError),
    #[error("no container to stop")]
    NoContainer,
    #[error("failed to stop container {container_id}: {source}")]
    StopFailed {
        container_id: String,
        source: SandboxError,
    },
    #[error("container not started: call start first")]
    NotStarted,
    #[error("invalid worker call: {0}")]
    InvalidCall(#[from] WorkerToolError),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Replace `env:NAME` values with the host's `NAME` (empty when unset).
pub fn expand_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .map(|(key, value)| {
            let resolved = match value.strip_prefix(HOST_ENV_PREFIX) {
                Some(name) => std::env::var(name).unwrap_or_default(),
                None => value.clone(),
            };
            (key.clone(), resolved)
        })
        .collect()
}

/// What the runner needs from a worker executor.
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn start(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Release the sandbox. The container id is cleared even on failure.
    async fn stop(&mut self, cancel: &CancellationToken) -> Result<()>;

    async fn run_worker(
        &self,
        call: &WorkerCall,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<WorkerRunResult>;

    fn container_id(&self) -> Option<&str>;
}

/// Executor backed by a `SandboxProvider`.
pub struct SandboxExecutor {
    config: WorkerConfig,
    repo_path: PathBuf,
    sandbox: Arc<dyn SandboxProvider>,
    container_id: Option<String>,
    /// Env the container was started with, after expansion.
    container_env: BTreeMap<String, String>,
    run_seq: AtomicU64,
}

impl std::fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxExecutor")
            .field("repo_path", &self.repo_path)
            .field("container_id", &self.container_id)
            .finish_non_exhaustive()
    }
}

impl SandboxExecutor {
    pub fn new(config: WorkerConfig, repo_path: PathBuf, sandbox: Arc<dyn SandboxProvider>) -> Self {
        Self {
            config,
            repo_path,
            sandbox,
            container_id: None,
            container_env: BTreeMap::new(),
            run_seq: AtomicU64::new(0),
        }
    }

    pub fn repo_path(&self) -> &std::path::Path {
        &self.repo_path
    }

    fn max_run_time(&self) -> Duration {
        self.config.max_run_time()
    }

    /// Monotonic, process-unique run id.
    fn next_run_id(&self) -> String {
        let seq = self.run_seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("run-{seq:04}-{}", Uuid::now_v7().simple())
    }

    /// Run-time env entries the container does not already carry.
    fn run_env(&self, call: &WorkerCall, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = expand_env(env);
        merged.extend(expand_env(&call.env));
        merged.retain(|key, value| self.container_env.get(key) != Some(value));
        merged
    }
}

fn summarize(exit_code: i32, output: &str) -> String {
    let last_line = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty());
    match last_line {
        Some(line) => format!("exit code {exit_code}: {}", truncate_str(line, SUMMARY_MAX_CHARS)),
        None => format!("exit code {exit_code}"),
    }
}

#[async_trait]
impl WorkerExecutor for SandboxExecutor {
    async fn start(&mut self, cancel: &CancellationToken) -> Result<()> {
        if let Some(existing) = &self.container_id {
            return Err(ExecutorError::AlreadyStarted(existing.clone()));
        }

        let repo_path = absolutize(&self.repo_path).map_err(|source| ExecutorError::RepoPath {
            path: self.repo_path.clone(),
            source,
        })?;
        self.repo_path.clone_from(&repo_path);

        let env = expand_env(&self.config.env);
        let spec = SandboxSpec {
            image: self.config.effective_image().to_string(),
            repo_path,
            env: env.clone(),
        };
        info!(image = %spec.image, repo = %spec.repo_path.display(), "starting worker sandbox");

        let container_id = self
            .sandbox
            .start(&spec, cancel)
            .await
            .map_err(ExecutorError::StartFailed)?;
        self.container_env = env;
        self.container_id = Some(container_id);
        Ok(())
    }

    async fn stop(&mut self, cancel: &CancellationToken) -> Result<()> {
        let Some(container_id) = self.container_id.take() else {
            return Err(ExecutorError::NoContainer);
        };
        self.container_env.clear();

        match self.sandbox.stop(&container_id, cancel).await {
            Ok(()) => {
                info!(container_id = %container_id, "worker sandbox stopped");
                Ok(())
            }
            Err(source) => Err(ExecutorError::StopFailed {
                container_id,
                source,
            }),
        }
    }

    async fn run_worker(
        &self,
        call: &WorkerCall,
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<WorkerRunResult> {
        let container_id = self.container_id.as_deref().ok_or(ExecutorError::NotStarted)?;
        let run_env = self.run_env(call, env);
        let invocation = build_invocation(call, self.config.effective_kind(), &run_env)?;

        let id = self.next_run_id();
        let started_at = Utc::now();
        let limit = self.max_run_time();
        debug!(run_id = %id, container_id, program = %invocation.argv[0], "running worker");

        let run_token = cancel.child_token();
        let exec = self
            .sandbox
            .exec(container_id, &invocation.argv, invocation.stdin, &run_token);
        let outcome = match tokio::time::timeout(limit, exec).await {
            Ok(result) => result.map_err(|err| err.to_string()),
            Err(_) => {
                run_token.cancel();
                Err(format!("worker timed out after {} seconds", limit.as_secs()))
            }
        };
        let finished_at = Utc::now();

        let result = match outcome {
            Ok(output) => {
                info!(run_id = %id, exit_code = output.exit_code, "worker run finished");
                WorkerRunResult {
                    summary: summarize(output.exit_code, &output.output),
                    id,
                    started_at,
                    finished_at,
                    exit_code: output.exit_code,
                    raw_output: output.output,
                    error: None,
                }
            }
            Err(error) => {
                warn!(run_id = %id, error = %error, "worker execution failed");
                WorkerRunResult {
                    id,
                    started_at,
                    finished_at,
                    exit_code: -1,
                    raw_output: String::new(),
                    summary: format!("Worker execution failed: {error}"),
                    error: Some(error),
                }
            }
        };
        Ok(result)
    }

    fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ExecOutput;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSandbox {
        fail_start: bool,
        fail_stop: bool,
        exec_error: Option<String>,
        hang: bool,
        started: Mutex<Vec<SandboxSpec>>,
        execs: Mutex<Vec<Vec<String>>>,
        stopped: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SandboxProvider for RecordingSandbox {
        async fn start(&self, spec: &SandboxSpec, _cancel: &CancellationToken) -> crate::sandbox::Result<String> {
            if self.fail_start {
                return Err(SandboxError::PullFailed {
                    image: spec.image.clone(),
                    reason: "denied".to_string(),
                });
            }
            self.started.lock().unwrap().push(spec.clone());
            Ok("c-1".to_string())
        }

        async fn exec(
            &self,
            _container_id: &str,
            argv: &[String],
            _stdin: Option<String>,
            cancel: &CancellationToken,
        ) -> crate::sandbox::Result<ExecOutput> {
            self.execs.lock().unwrap().push(argv.to_vec());
            if self.hang {
                cancel.cancelled().await;
                return Err(SandboxError::Cancelled);
            }
            if let Some(message) = &self.exec_error {
                return Err(SandboxError::Exec(message.clone()));
            }
            Ok(ExecOutput {
                exit_code: 0,
                output: "working\nall done\n".to_string(),
            })
        }

        async fn stop(&self, container_id: &str, _cancel: &CancellationToken) -> crate::sandbox::Result<()> {
            self.stopped.lock().unwrap().push(container_id.to_string());
            if self.fail_stop {
                return Err(SandboxError::Teardown("boom".to_string()));
            }
            Ok(())
        }
    }

    fn executor(sandbox: Arc<RecordingSandbox>, config: WorkerConfig) -> SandboxExecutor {
        SandboxExecutor::new(config, PathBuf::new(), sandbox)
    }

    fn call(prompt: &str) -> WorkerCall {
        WorkerCall {
            mode: "exec".to_string(),
            prompt: prompt.to_string(),
            ..WorkerCall::default()
        }
    }

    #[test]
    fn expand_env_reads_host_values() {
        std::env::set_var("AGENT_RUNNER_TEST_EXPAND", "secret");
        let env = BTreeMap::from([
            ("A".to_string(), "env:AGENT_RUNNER_TEST_EXPAND".to_string()),
            ("B".to_string(), "literal".to_string()),
            ("C".to_string(), "env:AGENT_RUNNER_TEST_UNSET_VAR".to_string()),
        ]);
        let expanded = expand_env(&env);
        assert_eq!(expanded["A"], "secret");
        assert_eq!(expanded["B"], "literal");
        assert_eq!(expanded["C"], "");
    }

    #[tokio::test]
    async fn start_resolves_repo_and_expands_env_at_start() {
        let sandbox = Arc::new(RecordingSandbox::default());
        let config = WorkerConfig {
            env: BTreeMap::from([("TOKEN".to_string(), "env:AGENT_RUNNER_TEST_START_TOKEN".to_string())]),
            ..WorkerConfig::default()
        };
        let mut executor = executor(Arc::clone(&sandbox), config);

        std::env::set_var("AGENT_RUNNER_TEST_START_TOKEN", "at-start");
        executor.start(&CancellationToken::new()).await.unwrap();
        std::env::set_var("AGENT_RUNNER_TEST_START_TOKEN", "later");

        let started = sandbox.started.lock().unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].env["TOKEN"], "at-start");
        assert_eq!(started[0].repo_path, std::env::current_dir().unwrap());
        assert_eq!(started[0].image, runner_core::config::DEFAULT_WORKER_IMAGE);
        assert_eq!(executor.container_id(), Some("c-1"));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let sandbox = Arc::new(RecordingSandbox::default());
        let mut executor = executor(sandbox, WorkerConfig::default());
        let cancel = CancellationToken::new();
        executor.start(&cancel).await.unwrap();
        let err = executor.start(&cancel).await.unwrap_err();
        assert!(err.to_string().contains("already started"));
    }

    #[tokio::test]
    async fn failed_start_leaves_no_container() {
        let sandbox = Arc::new(RecordingSandbox {
            fail_start: true,
            ..RecordingSandbox::default()
        });
        let mut executor = executor(sandbox, WorkerConfig::default());
        let err = executor.start(&CancellationToken::new()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("failed to start container"), "{message}");
        assert!(message.contains("failed to pull image"), "{message}");
        assert!(executor.container_id().is_none());
    }

    #[tokio::test]
    async fn stop_without_container_fails() {
        let sandbox = Arc::new(RecordingSandbox::default());
        let mut executor = executor(sandbox, WorkerConfig::default());
        let err = executor.stop(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("no container"));
    }

    #[tokio::test]
    async fn stop_clears_container_even_on_failure() {
        let sandbox = Arc::new(RecordingSandbox {
            fail_stop: true,
            ..RecordingSandbox::default()
        });
        let mut executor = executor(Arc::clone(&sandbox), WorkerConfig::default());
        let cancel = CancellationToken::new();
        executor.start(&cancel).await.unwrap();
        assert!(executor.stop(&cancel).await.is_err());
        assert!(executor.container_id().is_none());
        assert_eq!(sandbox.stopped.lock().unwrap().as_slice(), ["c-1"]);
    }

    #[tokio::test]
    async fn run_worker_requires_started_container() {
        let sandbox = Arc::new(RecordingSandbox::default());
        let executor = executor(sandbox, WorkerConfig::default());
        let err = executor
            .run_worker(&call("p"), &BTreeMap::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("container not started"));
    }

    #[tokio::test]
    async fn run_worker_builds_canonical_argv_and_summary() {
        let sandbox = Arc::new(RecordingSandbox::default());
        let mut executor = executor(Arc::clone(&sandbox), WorkerConfig::default());
        let cancel = CancellationToken::new();
        executor.start(&cancel).await.unwrap();

        let first = executor.run_worker(&call("do it"), &BTreeMap::new(), &cancel).await.unwrap();
        let second = executor.run_worker(&call("again"), &BTreeMap::new(), &cancel).await.unwrap();

        let execs = sandbox.execs.lock().unwrap();
        assert_eq!(
            execs[0],
            [
                "codex",
                "exec",
                "--sandbox",
                "workspace-write",
                "--json",
                "--cwd",
                "/workspace/project",
                "do it"
            ]
        );
        assert_eq!(first.exit_code, 0);
        assert_eq!(first.summary, "exit code 0: all done");
        assert!(first.error.is_none());
        assert!(first.id < second.id, "{} !< {}", first.id, second.id);
        assert!(first.started_at <= first.finished_at);
    }

    #[tokio::test]
    async fn run_worker_records_exec_error() {
        let sandbox = Arc::new(RecordingSandbox {
            exec_error: Some("429 Too Many Requests".to_string()),
            ..RecordingSandbox::default()
        });
        let mut executor = executor(sandbox, WorkerConfig::default());
        let cancel = CancellationToken::new();
        executor.start(&cancel).await.unwrap();
        let result = executor.run_worker(&call("p"), &BTreeMap::new(), &cancel).await.unwrap();
        assert!(result.summary.starts_with("Worker execution failed"));
        assert!(result.error.unwrap().contains("429"));
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_worker_enforces_max_run_time() {
        let sandbox = Arc::new(RecordingSandbox {
            hang: true,
            ..RecordingSandbox::default()
        });
        let config = WorkerConfig {
            max_run_time_sec: 5,
            ..WorkerConfig::default()
        };
        let mut executor = executor(sandbox, config);
        let cancel = CancellationToken::new();
        executor.start(&cancel).await.unwrap();
        let result = executor.run_worker(&call("p"), &BTreeMap::new(), &cancel).await.unwrap();
        assert_eq!(result.error.as_deref(), Some("worker timed out after 5 seconds"));
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn run_env_only_prefixes_values_missing_from_container() {
        let sandbox = Arc::new(RecordingSandbox::default());
        let config = WorkerConfig {
            env: BTreeMap::from([("MODE".to_string(), "ci".to_string())]),
            ..WorkerConfig::default()
        };
        let mut executor = executor(Arc::clone(&sandbox), config.clone());
        let cancel = CancellationToken::new();
        executor.start(&cancel).await.unwrap();

        let mut c = call("p");
        c.env.insert("EXTRA".to_string(), "1".to_string());
        executor.run_worker(&c, &config.env, &cancel).await.unwrap();

        let execs = sandbox.execs.lock().unwrap();
        assert_eq!(&execs[0][..3], ["env", "EXTRA=1", "codex"]);
    }

    #[tokio::test]
    async fn invalid_call_is_rejected_before_exec() {
        let sandbox = Arc::new(RecordingSandbox::default());
        let mut executor = executor(Arc::clone(&sandbox), WorkerConfig::default());
        let cancel = CancellationToken::new();
        executor.start(&cancel).await.unwrap();
        let mut c = call("p");
        c.mode = "chat".to_string();
        let err = executor.run_worker(&c, &BTreeMap::new(), &cancel).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidCall(_)));
        assert!(sandbox.execs.lock().unwrap().is_empty());
    }
}
