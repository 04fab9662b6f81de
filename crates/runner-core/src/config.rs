//! Task description parsing.
//!
//! The task description is a YAML document read from stdin. Missing
//! sections take their defaults; `task.id` is the only required field.
//! Precedence for overridable settings: CLI flags > YAML > defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::tooling::ToolingConfig;

pub const DEFAULT_META_KIND: &str = "openai-chat";
pub const DEFAULT_META_MODEL: &str = "gpt-5.2";
pub const DEFAULT_WORKER_KIND: &str = "codex-cli";
pub const DEFAULT_WORKER_IMAGE: &str = "ghcr.io/agent-runner/worker-codex:latest";
pub const DEFAULT_MAX_LOOPS: u32 = 10;
pub const DEFAULT_MAX_RUN_TIME_SEC: u64 = 30 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read task description: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("malformed task YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Root of the task description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub version: u32,
    pub task: TaskSpec,
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    pub id: String,
    pub title: String,
    pub repo: PathBuf,
    pub prd: PrdConfig,
    pub test: TestConfig,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            repo: PathBuf::from("."),
            prd: PrdConfig::default(),
            test: TestConfig::default(),
        }
    }
}

/// Where the requirements text comes from. Inline text wins over a path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrdConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrdSource {
    Inline(String),
    File(PathBuf),
}

impl PrdConfig {
    pub fn source(&self) -> Option<PrdSource> {
        if let Some(text) = self.text.as_deref().filter(|t| !t.trim().is_empty()) {
            return Some(PrdSource::Inline(text.to_string()));
        }
        self.path
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| PrdSource::File(p.clone()))
    }
}

/// Optional post-run verification command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    pub command: Option<String>,
    pub cwd: Option<PathBuf>,
}

impl TestConfig {
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }

    /// Absolute `cwd` as given, else relative to the repo, else the repo.
    pub fn resolve_cwd(&self, repo_path: &Path) -> PathBuf {
        match self.cwd.as_deref().filter(|p| !p.as_os_str().is_empty()) {
            Some(cwd) if cwd.is_absolute() => cwd.to_path_buf(),
            Some(cwd) => repo_path.join(cwd),
            None => repo_path.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub meta: MetaConfig,
    pub worker: WorkerConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tooling: Option<ToolingConfig>,
    /// Execution-loop safety cap; 0 means the default.
    pub max_loops: u32,
}

impl RunnerConfig {
    pub fn effective_max_loops(&self) -> u32 {
        if self.max_loops == 0 {
            DEFAULT_MAX_LOOPS
        } else {
            self.max_loops
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    pub kind: String,
    pub model: String,
    pub system_prompt: String,
}

impl MetaConfig {
    pub fn effective_kind(&self) -> &str {
        if self.kind.trim().is_empty() {
            DEFAULT_META_KIND
        } else {
            self.kind.trim()
        }
    }

    pub fn effective_model(&self) -> &str {
        if self.model.trim().is_empty() {
            DEFAULT_META_MODEL
        } else {
            self.model.trim()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub kind: String,
    pub docker_image: String,
    pub max_run_time_sec: i64,
    /// Values prefixed with `env:` are resolved from the host at use time.
    pub env: BTreeMap<String, String>,
}

impl WorkerConfig {
    pub fn effective_kind(&self) -> &str {
        if self.kind.trim().is_empty() {
            DEFAULT_WORKER_KIND
        } else {
            self.kind.trim()
        }
    }

    pub fn effective_image(&self) -> &str {
        if self.docker_image.trim().is_empty() {
            DEFAULT_WORKER_IMAGE
        } else {
            self.docker_image.trim()
        }
    }

    /// Per-RunWorker deadline.
    pub fn max_run_time(&self) -> Duration {
        let secs = u64::try_from(self.max_run_time_sec)
            .ok()
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_MAX_RUN_TIME_SEC);
        Duration::from_secs(secs)
    }
}

impl TaskConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: TaskConfig = serde_yaml::from_str(content)?;
        config.normalize()?;
        Ok(config)
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut content = String::new();
        reader.read_to_string(&mut content)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    fn normalize(&mut self) -> Result<(), ConfigError> {
        if self.task.id.trim().is_empty() {
            return Err(ConfigError::MissingField("task.id"));
        }
        if self.version == 0 {
            self.version = 1;
        }
        if self.task.repo.as_os_str().is_empty() {
            self.task.repo = PathBuf::from(".");
        }
        Ok(())
    }

    /// Apply the `--meta-model` flag.
    pub fn apply_meta_model_override(&mut self, model: Option<&str>) {
        if let Some(model) = model.map(str::trim).filter(|m| !m.is_empty()) {
            self.runner.meta.model = model.to_string();
        }
    }
}

/// Make `path` absolute against the current directory; empty means `.`.
pub fn absolutize(path: &Path) -> std::io::Result<PathBuf> {
    let path = if path.as_os_str().is_empty() {
        Path::new(".")
    } else {
        path
    };
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(normalize_lexically(&absolute))
}

/// Drop `.` components and fold `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
