//! Sandbox provider interface and the Docker CLI implementation.
//!
//! A sandbox is a long-lived container with the task repository
//! bind-mounted at `/workspace/project`. The executor starts it once,
//! runs worker commands in it, and force-removes it at teardown.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::process::{self, ProcessError};

/// Repository mount point inside the sandbox; also the exec workdir.
pub const WORKSPACE_MOUNT: &str = "/workspace/project";

/// Idle command keeping the container alive between execs.
pub const KEEP_ALIVE_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

/// Host variables forwarded into the sandbox when set.
pub const PASSTHROUGH_ENV: [&str; 5] = [
    "CODEX_API_KEY",
    "GEMINI_API_KEY",
    "GOOGLE_API_KEY",
    "GOOGLE_GENAI_USE_VERTEXAI",
    "GOOGLE_CLOUD_PROJECT",
];

/// Host credential paths (relative to `$HOME`) mounted read-only.
const CREDENTIAL_MOUNTS: [(&str, &str); 3] = [
    (".codex/auth.json", "/root/.codex/auth.json"),
    (".config/claude", "/root/.config/claude"),
    (".gemini", "/root/.gemini"),
];

/// Stderr prefix docker prints when the exec target is gone.
const MISSING_CONTAINER_PREFIX: &str = "Error response from daemon: No such container";

/// Upper bound for `docker rm -f`.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to pull image {image}: {reason}")]
    PullFailed { image: String, reason: String },
    #[error("sandbox startup failed: {0}")]
    Startup(String),
    #[error("no such container: {0}")]
    NoSuchContainer(String),
    #[error("sandbox exec failed: {0}")]
    Exec(String),
    #[error("sandbox teardown failed: {0}")]
    Teardown(String),
    #[error("sandbox operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// What to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    pub image: String,
    /// Absolute host path of the repository.
    pub repo_path: PathBuf,
    /// Environment after `env:` expansion.
    pub env: BTreeMap<String, String>,
}

/// Result of one command inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    /// Stdout, a blank line, then stderr.
    pub output: String,
}

/// Lifecycle of an isolated execution environment.
///
/// `exec` may be called concurrently for the same container.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Create and start a sandbox. Never returns an id on failure.
    async fn start(&self, spec: &SandboxSpec, cancel: &CancellationToken) -> Result<String>;

    /// Run `argv` in `/workspace/project`.
    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        stdin: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput>;

    /// Force-remove with zero grace.
    async fn stop(&self, container_id: &str, cancel: &CancellationToken) -> Result<()>;
}

/// Sandbox backed by the `docker` CLI.
#[derive(Debug)]
pub struct DockerSandbox {
    docker_bin: String,
    home_dir: Option<PathBuf>,
    containers: Mutex<HashSet<String>>,
}

impl Default for DockerSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerSandbox {
    pub fn new() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            home_dir: dirs::home_dir(),
            containers: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_docker_bin(mut self, bin: impl Into<String>) -> Self {
        self.docker_bin = bin.into();
        self
    }

    pub fn with_home_dir(mut self, home: Option<PathBuf>) -> Self {
        self.home_dir = home;
        self
    }

    fn command(&self) -> Command {
        Command::new(&self.docker_bin)
    }

    fn is_tracked(&self, container_id: &str) -> bool {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(container_id)
    }

    fn track(&self, container_id: &str, live: bool) {
        let mut containers = self.containers.lock().unwrap_or_else(PoisonError::into_inner);
        if live {
            containers.insert(container_id.to_string());
        } else {
            containers.remove(container_id);
        }
    }

    async fn ensure_image(&self, image: &str, cancel: &CancellationToken) -> Result<()> {
        let mut inspect = self.command();
        inspect.args(["image", "inspect", image]);
        match process::run(inspect, None, None, cancel).await {
            Ok(output) if output.success() => return Ok(()),
            Ok(_) => {}
            Err(ProcessError::Cancelled) => return Err(SandboxError::Cancelled),
            Err(err) => {
                return Err(SandboxError::PullFailed {
                    image: image.to_string(),
                    reason: err.to_string(),
                })
            }
        }

        info!(image, "image not present locally; pulling");
        let mut pull = self.command();
        pull.args(["pull", image]);
        match process::run(pull, None, None, cancel).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(SandboxError::PullFailed {
                image: image.to_string(),
                reason: output.stderr.trim().to_string(),
            }),
            Err(ProcessError::Cancelled) => Err(SandboxError::Cancelled),
            Err(err) => Err(SandboxError::PullFailed {
                image: image.to_string(),
                reason: err.to_string(),
            }),
        }
    }
}

/// Arguments for `docker run` after the binary name.
pub fn run_args(spec: &SandboxSpec, home_dir: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "-v".to_string(),
        format!("{}:{WORKSPACE_MOUNT}", spec.repo_path.display()),
        "-w".to_string(),
        WORKSPACE_MOUNT.to_string(),
    ];

    let mut env = spec.env.clone();
    for key in PASSTHROUGH_ENV {
        if env.contains_key(key) {
            continue;
        }
        if let Ok(value) = std::env::var(key) {
            if !value.is_empty() {
                env.insert(key.to_string(), value);
            }
        }
    }
    for (key, value) in &env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }

    if let Some(home) = home_dir {
        for (relative, target) in CREDENTIAL_MOUNTS {
            let source = home.join(relative);
            if source.exists() {
                args.push("-v".to_string());
                args.push(format!("{}:{target}:ro", source.display()));
            }
        }
    }

    args.push(spec.image.clone());
    args.extend(KEEP_ALIVE_COMMAND.iter().map(|s| (*s).to_string()));
    args
}

/// Arguments for `docker exec` after the binary name.
pub fn exec_args(container_id: &str, argv: &[String], interactive: bool) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if interactive {
        args.push("-i".to_string());
    }
    args.push("-w".to_string());
    args.push(WORKSPACE_MOUNT.to_string());
    args.push(container_id.to_string());
    args.extend(argv.iter().cloned());
    args
}

#[async_trait]
impl SandboxProvider for DockerSandbox {
    async fn start(&self, spec: &SandboxSpec, cancel: &CancellationToken) -> Result<String> {
        self.ensure_image(&spec.image, cancel).await?;

        let mut run = self.command();
        run.args(run_args(spec, self.home_dir.as_deref()));
        debug!(image = %spec.image, repo = %spec.repo_path.display(), "starting container");

        let output = match process::run(run, None, None, cancel).await {
            Ok(output) => output,
            Err(ProcessError::Cancelled) => return Err(SandboxError::Cancelled),
            Err(err) => return Err(SandboxError::Startup(err.to_string())),
        };
        if !output.success() {
            return Err(SandboxError::Startup(format!(
                "docker run exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        let container_id = output.stdout.trim().to_string();
        if container_id.is_empty() {
            return Err(SandboxError::Startup(
                "docker run returned no container id".to_string(),
            ));
        }

        self.track(&container_id, true);
        info!(container_id = %container_id, image = %spec.image, "container started");
        Ok(container_id)
    }

    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        stdin: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        if !self.is_tracked(container_id) {
            return Err(SandboxError::NoSuchContainer(container_id.to_string()));
        }
        if argv.is_empty() {
            return Err(SandboxError::Exec("empty command".to_string()));
        }

        let mut exec = self.command();
        exec.args(exec_args(container_id, argv, stdin.is_some()));
        debug!(container_id, program = %argv[0], "exec in container");

        let output = match process::run(exec, stdin, None, cancel).await {
            Ok(output) => output,
            Err(ProcessError::Cancelled) => return Err(SandboxError::Cancelled),
            Err(err) => return Err(SandboxError::Exec(err.to_string())),
        };
        // Worker output may mention missing containers too; only a failed
        // exec led by the daemon's error counts.
        if !output.success() && output.stderr.trim_start().starts_with(MISSING_CONTAINER_PREFIX) {
            self.track(container_id, false);
            return Err(SandboxError::NoSuchContainer(container_id.to_string()));
        }

        Ok(ExecOutput {
            exit_code: output.exit_code,
            output: output.combined(),
        })
    }

    async fn stop(&self, container_id: &str, cancel: &CancellationToken) -> Result<()> {
        self.track(container_id, false);

        let mut rm = self.command();
        rm.args(["rm", "-f", container_id]);
        let output = match process::run(rm, None, Some(TEARDOWN_TIMEOUT), cancel).await {
            Ok(output) => output,
            Err(ProcessError::Cancelled) => return Err(SandboxError::Cancelled),
            Err(err) => return Err(SandboxError::Teardown(err.to_string())),
        };
        if !output.success() {
            warn!(container_id, stderr = %output.stderr.trim(), "docker rm failed");
            return Err(SandboxError::Teardown(output.stderr.trim().to_string()));
        }
        info!(container_id, "container removed");
        Ok(())
    }
}
