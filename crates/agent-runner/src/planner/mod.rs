//! Planner clients.
//!
//! The runner talks to the planning agent only through [`Planner`].
//! Adapters:
//! - [`MockPlanner`]: deterministic, no network.
//! - [`TextPlanner`] over a [`Completion`] backend: prompts a model for a
//!   YAML envelope and decodes it. Backends are the local agent CLIs
//!   ([`CliCompletion`]) and the OpenAI chat API ([`OpenAiChat`]).
//! - [`ToolingPlanner`]: picks a backend per call through the selector.

mod cli;
mod mock;
mod openai;
mod tooling;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use runner_core::config::MetaConfig;
use runner_core::extract::extract_yaml;
use runner_core::prompt;
use runner_core::protocol::{PlannerMessage, PlannerPayload, ProtocolError};
use runner_core::tooling::ToolCandidate;
use runner_core::{CompletionAssessment, NextActionResponse, PlanTaskResponse, TaskSummary};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use cli::CliCompletion;
pub use mock::MockPlanner;
pub use openai::OpenAiChat;
pub use tooling::{CandidatePlannerFactory, PlannerFactory, ToolingPlanner};

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("planner transport error: {0}")]
    Transport(String),
    #[error("planner rate limited: {0}")]
    RateLimited(String),
    #[error("invalid planner response: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("planner call cancelled")]
    Cancelled,
    #[error("unsupported planner kind: {0}")]
    UnsupportedKind(String),
    #[error("planner is not configured: {0}")]
    NotConfigured(String),
}

pub type Result<T> = std::result::Result<T, PlannerError>;

/// Request/response interface to the planning agent.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan_task(&self, prd_text: &str, cancel: &CancellationToken) -> Result<PlanTaskResponse>;

    async fn next_action(
        &self,
        summary: &TaskSummary,
        cancel: &CancellationToken,
    ) -> Result<NextActionResponse>;

    async fn assess_completion(
        &self,
        summary: &TaskSummary,
        cancel: &CancellationToken,
    ) -> Result<CompletionAssessment>;
}

/// A model that turns a system and user prompt into text.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, system: &str, user: &str, cancel: &CancellationToken) -> Result<String>;
}

/// Planner that prompts a text model and decodes the YAML envelope.
pub struct TextPlanner<C> {
    backend: C,
    system_prompt: Option<String>,
}

impl<C> std::fmt::Debug for TextPlanner<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextPlanner")
            .field("system_prompt", &self.system_prompt.is_some())
            .finish_non_exhaustive()
    }
}

impl<C: Completion> TextPlanner<C> {
    /// `system_prompt` replaces every built-in system prompt when set.
    pub fn new(backend: C, system_prompt: Option<String>) -> Self {
        Self {
            backend,
            system_prompt: system_prompt.filter(|p| !p.trim().is_empty()),
        }
    }

    async fn ask<T: PlannerPayload>(
        &self,
        default_system: &str,
        user: &str,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let system = prompt::system_or_default(self.system_prompt.as_deref(), default_system);
        let raw = self.backend.complete(system, user, cancel).await?;
        let yaml = extract_yaml(&raw);
        debug!(message_type = T::MESSAGE_TYPE, bytes = yaml.len(), "decoding planner response");
        Ok(PlannerMessage::decode::<T>(&yaml)?)
    }
}

#[async_trait]
impl<C: Completion> Planner for TextPlanner<C> {
    async fn plan_task(&self, prd_text: &str, cancel: &CancellationToken) -> Result<PlanTaskResponse> {
        self.ask(prompt::plan_task_system(), &prompt::plan_task_user(prd_text), cancel)
            .await
    }

    async fn next_action(
        &self,
        summary: &TaskSummary,
        cancel: &CancellationToken,
    ) -> Result<NextActionResponse> {
        self.ask(prompt::next_action_system(), &prompt::next_action_user(summary), cancel)
            .await
    }

    async fn assess_completion(
        &self,
        summary: &TaskSummary,
        cancel: &CancellationToken,
    ) -> Result<CompletionAssessment> {
        self.ask(
            prompt::assess_completion_system(),
            &prompt::assess_completion_user(summary),
            cancel,
        )
        .await
    }
}

/// Everything needed to build one planner adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlannerSpec {
    pub tool: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub cli_path: Option<String>,
    pub flags: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl PlannerSpec {
    pub fn from_meta(meta: &MetaConfig) -> Self {
        Self {
            tool: meta.effective_kind().to_string(),
            model: meta.effective_model().to_string(),
            system_prompt: Some(meta.system_prompt.clone()).filter(|p| !p.trim().is_empty()),
            ..Self::default()
        }
    }

    /// Candidate settings layered over the meta config.
    pub fn from_candidate(candidate: &ToolCandidate, meta: &MetaConfig) -> Self {
        let base = Self::from_meta(meta);
        Self {
            tool: candidate.tool.clone(),
            model: candidate
                .model
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or(base.model),
            system_prompt: candidate
                .system_prompt
                .clone()
                .filter(|p| !p.trim().is_empty())
                .or(base.system_prompt),
            cli_path: candidate.cli_path.clone(),
            flags: candidate.flags.clone(),
            env: candidate.env.clone(),
        }
    }
}

/// Build the adapter named by `spec.tool`.
pub fn build_planner(spec: &PlannerSpec) -> Result<Arc<dyn Planner>> {
    match spec.tool.as_str() {
        "mock" => Ok(Arc::new(MockPlanner::new())),
        "openai-chat" => {
            let backend = OpenAiChat::from_env(&spec.model)?;
            Ok(Arc::new(TextPlanner::new(backend, spec.system_prompt.clone())))
        }
        tool if CliCompletion::supports(tool) => {
            let backend = CliCompletion::from_spec(spec)?;
            Ok(Arc::new(TextPlanner::new(backend, spec.system_prompt.clone())))
        }
        other => Err(PlannerError::UnsupportedKind(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_core::protocol::PlannerAction;
    use runner_core::TaskState;
    use std::sync::Mutex;

    struct Canned {
        replies: Mutex<Vec<String>>,
        systems: Mutex<Vec<String>>,
    }

    impl Canned {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().rev().map(|s| (*s).to_string()).collect()),
                systems: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Completion for Canned {
        async fn complete(&self, system: &str, _user: &str, _cancel: &CancellationToken) -> Result<String> {
            self.systems.lock().unwrap().push(system.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| PlannerError::Transport("no reply".to_string()))
        }
    }

    fn summary() -> TaskSummary {
        TaskSummary {
            title: "t".to_string(),
            state: TaskState::Running,
            acceptance_criteria: Vec::new(),
            worker_runs_count: 0,
            worker_runs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn text_planner_decodes_fenced_reply() {
        let planner = TextPlanner::new(
            Canned::new(&["Sure!\n```yaml\ntype: next_action\nversion: 1\npayload:\n  decision:\n    action: mark_complete\n```"]),
            None,
        );
        let action = planner.next_action(&summary(), &CancellationToken::new()).await.unwrap();
        assert_eq!(action.decision.action, PlannerAction::MarkComplete);
    }

    #[tokio::test]
    async fn text_planner_rejects_wrong_message_type() {
        let planner = TextPlanner::new(
            Canned::new(&["type: plan_task\nversion: 1\npayload: {}\n"]),
            None,
        );
        let err = planner
            .assess_completion(&summary(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::Protocol(_)));
    }

    #[tokio::test]
    async fn configured_system_prompt_replaces_default() {
        let backend = Canned::new(&["type: plan_task\nversion: 1\npayload:\n  task_id: T\n"]);
        let planner = TextPlanner::new(backend, Some("be terse".to_string()));
        planner.plan_task("prd", &CancellationToken::new()).await.unwrap();
        assert_eq!(planner.backend.systems.lock().unwrap().as_slice(), ["be terse"]);
    }

    #[test]
    fn spec_from_candidate_inherits_meta_defaults() {
        let meta = MetaConfig {
            kind: "openai-chat".to_string(),
            model: "gpt-5.2".to_string(),
            system_prompt: "meta prompt".to_string(),
        };
        let candidate = ToolCandidate::new("claude-code", None);
        let spec = PlannerSpec::from_candidate(&candidate, &meta);
        assert_eq!(spec.tool, "claude-code");
        assert_eq!(spec.model, "gpt-5.2");
        assert_eq!(spec.system_prompt.as_deref(), Some("meta prompt"));

        let candidate = ToolCandidate {
            system_prompt: Some("own".to_string()),
            ..ToolCandidate::new("codex-cli", Some("o3"))
        };
        let spec = PlannerSpec::from_candidate(&candidate, &meta);
        assert_eq!(spec.model, "o3");
        assert_eq!(spec.system_prompt.as_deref(), Some("own"));
    }

    #[test]
    fn build_planner_by_kind() {
        let mock = PlannerSpec {
            tool: "mock".to_string(),
            ..PlannerSpec::default()
        };
        assert!(build_planner(&mock).is_ok());

        let codex = PlannerSpec {
            tool: "codex-cli".to_string(),
            model: "gpt-5.2".to_string(),
            ..PlannerSpec::default()
        };
        assert!(build_planner(&codex).is_ok());

        let unknown = PlannerSpec {
            tool: "carrier-pigeon".to_string(),
            ..PlannerSpec::default()
        };
        assert!(matches!(
            build_planner(&unknown),
            Err(PlannerError::UnsupportedKind(_))
        ));
    }
}
