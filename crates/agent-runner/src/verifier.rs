//! Host-side verification command.
//!
//! Runs the task's `test.command` through `sh -c` after a task completes.
//! The outcome is recorded on the task context; it never changes the task
//! state.

use std::path::{Path, PathBuf};

use runner_core::config::TestConfig;
use runner_core::VerificationResult;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::process::{self, ProcessError};

/// Lines of output kept in the summary on failure.
const FAILURE_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("verification working directory does not exist: {0}")]
    MissingCwd(PathBuf),
    #[error("verification command could not run: {0}")]
    Process(#[from] ProcessError),
}

pub type Result<T> = std::result::Result<T, VerifierError>;

/// Verifier configuration.
#[derive(Debug, Clone, Default)]
pub struct VerifierConfig {
    pub command: Option<String>,
    pub cwd: Option<PathBuf>,
}

impl VerifierConfig {
    pub fn from_test_config(test: &TestConfig) -> Self {
        Self {
            command: test.command().map(str::to_string),
            cwd: test.cwd.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Verifier {
    config: VerifierConfig,
}

impl Verifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    pub fn from_test_config(test: &TestConfig) -> Self {
        Self::new(VerifierConfig::from_test_config(test))
    }

    pub fn has_command(&self) -> bool {
        self.config
            .command
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }

    /// Absolute cwd as given, else `repo/cwd`, else `repo`.
    pub fn resolve_cwd(&self, repo_path: &Path) -> PathBuf {
        TestConfig {
            command: None,
            cwd: self.config.cwd.clone(),
        }
        .resolve_cwd(repo_path)
    }

    /// Run the command. `Ok(None)` when nothing is configured.
    pub async fn execute(
        &self,
        repo_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<VerificationResult>> {
        let Some(command) = self.config.command.as_deref().map(str::trim).filter(|c| !c.is_empty()) else {
            return Ok(None);
        };
        let cwd = self.resolve_cwd(repo_path);
        if !cwd.is_dir() {
            return Err(VerifierError::MissingCwd(cwd));
        }

        info!(cmd = %command, cwd = %cwd.display(), "running verification");
        let mut sh = Command::new("sh");
        sh.arg("-c").arg(command).current_dir(&cwd);
        let output = process::run(sh, None, None, cancel).await?;

        let raw_output = output.combined();
        let summary = if output.success() {
            debug!(cmd = %command, duration_ms = output.duration_ms, "verification passed");
            "passed".to_string()
        } else {
            warn!(cmd = %command, exit_code = output.exit_code, "verification failed");
            format_failure_summary(output.exit_code, &raw_output)
        };

        Ok(Some(VerificationResult {
            command: command.to_string(),
            cwd,
            exit_code: output.exit_code,
            summary,
            raw_output,
        }))
    }
}

fn format_failure_summary(exit_code: i32, output: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let tail_start = lines.len().saturating_sub(FAILURE_TAIL_LINES);
    let tail = lines[tail_start..].join("\n");
    if tail.trim().is_empty() {
        format!("failed (exit {exit_code})")
    } else {
        format!("failed (exit {exit_code}); last output:\n{tail}")
    }
}
