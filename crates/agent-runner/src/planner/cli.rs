//! Planner backend that shells out to a local agent CLI.
//!
//! The joined system and user prompt is always fed on stdin so long task
//! summaries never hit argv limits. Runs on the host, not in the sandbox.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use runner_core::prompt;
use runner_core::rate_limit::is_rate_limit_message;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Completion, PlannerError, PlannerSpec, Result};
use crate::process::{self, ProcessError};

/// Upper bound for a single planner CLI call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const REASONING_EFFORT: &str = "medium";

/// Output kept in transport errors.
const ERROR_OUTPUT_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliTool {
    Codex,
    Claude,
    Gemini,
}

impl CliTool {
    fn parse(tool: &str) -> Option<Self> {
        match tool {
            "codex-cli" | "codex" => Some(Self::Codex),
            "claude-code" | "claude-code-cli" | "claude" => Some(Self::Claude),
            "gemini-cli" | "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }

    fn binary(self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CliCompletion {
    tool: CliTool,
    program: String,
    model: Option<String>,
    flags: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Duration,
}

impl CliCompletion {
    pub fn supports(tool: &str) -> bool {
        CliTool::parse(tool).is_some()
    }

    pub fn from_spec(spec: &PlannerSpec) -> Result<Self> {
        let tool = CliTool::parse(&spec.tool)
            .ok_or_else(|| PlannerError::UnsupportedKind(spec.tool.clone()))?;
        Ok(Self {
            tool,
            program: spec
                .cli_path
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| tool.binary().to_string()),
            model: Some(spec.model.clone()).filter(|m| !m.is_empty()),
            flags: spec.flags.clone(),
            env: spec.env.clone(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        match self.tool {
            CliTool::Codex => {
                args.push("exec".to_string());
                if let Some(model) = &self.model {
                    args.extend(["-m".to_string(), model.clone()]);
                }
                args.extend(["-c".to_string(), format!("reasoning_effort={REASONING_EFFORT}")]);
                args.extend(self.flags.iter().cloned());
                args.push("-".to_string());
            }
            CliTool::Claude | CliTool::Gemini => {
                if let Some(model) = &self.model {
                    args.extend(["--model".to_string(), model.clone()]);
                }
                args.extend(self.flags.iter().cloned());
                args.extend(["-p".to_string(), "-".to_string()]);
            }
        }
        args
    }
}

fn transport_error(message: String) -> PlannerError {
    if is_rate_limit_message(&message) {
        PlannerError::RateLimited(message)
    } else {
        PlannerError::Transport(message)
    }
}

#[async_trait]
impl Completion for CliCompletion {
    async fn complete(&self, system: &str, user: &str, cancel: &CancellationToken) -> Result<String> {
        let full_prompt = prompt::combined(system, user);
        let args = self.args();
        info!(
            program = %self.program,
            model = self.model.as_deref().unwrap_or("default"),
            prompt_len = full_prompt.len(),
            "calling planner cli"
        );
        debug!(args = ?args, "planner cli args");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args).envs(&self.env);

        let output = match process::run(cmd, Some(full_prompt), Some(self.timeout), cancel).await {
            Ok(output) => output,
            Err(ProcessError::Cancelled) => return Err(PlannerError::Cancelled),
            Err(err) => return Err(transport_error(format!("{} failed: {err}", self.program))),
        };

        if !output.success() {
            let combined = output.combined();
            warn!(
                program = %self.program,
                exit_code = output.exit_code,
                "planner cli exited with error"
            );
            return Err(transport_error(format!(
                "{} exited with code {}: {}",
                self.program,
                output.exit_code,
                process::truncate_str(combined.trim(), ERROR_OUTPUT_CHARS)
            )));
        }

        let response = output.stdout.trim().to_string();
        info!(
            program = %self.program,
            response_len = response.len(),
            duration_ms = output.duration_ms,
            "planner cli completed"
        );
        Ok(response)
    }
}
