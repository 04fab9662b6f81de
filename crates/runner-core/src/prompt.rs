//! Prompt assembly for planner adapters.
//!
//! Each planner operation has a default system prompt describing the YAML
//! envelope the model must answer with. A configured `system_prompt`
//! replaces the default wholesale.

use crate::protocol::{to_yaml, TaskSummary};

const PLAN_TASK_SYSTEM: &str = r#"You plan software development tasks.
Read the PRD and derive concrete, independently checkable acceptance criteria.
Answer with YAML only, in exactly this shape:

type: plan_task
version: 1
payload:
  task_id: "<short id>"
  acceptance_criteria:
    - id: "AC-1"
      description: "<observable outcome>"
      type: "<unit|e2e|manual>"
      critical: true
"#;

const NEXT_ACTION_SYSTEM: &str = r#"You steer a coding worker that runs inside a sandbox holding the repository.
Given the task summary, decide the next step:
- run_worker: send the worker one focused instruction
- mark_complete: every acceptance criterion appears satisfied
- abort: the task cannot be completed
Answer with YAML only, in exactly this shape:

type: next_action
version: 1
payload:
  decision:
    action: "run_worker"
    reason: "<why>"
  worker_call:
    worker_type: "codex-cli"
    mode: "exec"
    prompt: "<instruction for the worker>"
"#;

const ASSESS_COMPLETION_SYSTEM: &str = r#"You judge whether a coding task met its acceptance criteria.
Review the task summary and the worker runs, then give a verdict per criterion.
Answer with YAML only, in exactly this shape:

type: completion_assessment
version: 1
payload:
  all_criteria_satisfied: true
  summary: "<one paragraph>"
  by_criterion:
    - id: "AC-1"
      status: "passed"
      comment: "<evidence>"
"#;

/// Default system prompt per planner operation.
pub fn plan_task_system() -> &'static str {
    PLAN_TASK_SYSTEM
}

pub fn next_action_system() -> &'static str {
    NEXT_ACTION_SYSTEM
}

pub fn assess_completion_system() -> &'static str {
    ASSESS_COMPLETION_SYSTEM
}

/// Pick the configured system prompt over the built-in one.
pub fn system_or_default<'a>(configured: Option<&'a str>, default: &'a str) -> &'a str {
    configured.filter(|p| !p.trim().is_empty()).unwrap_or(default)
}

pub fn plan_task_user(prd_text: &str) -> String {
    format!("PRD:\n{prd_text}\n\nGenerate the plan.")
}

pub fn next_action_user(summary: &TaskSummary) -> String {
    format!("Task summary:\n{}\nDecide the next action.", to_yaml(summary))
}

pub fn assess_completion_user(summary: &TaskSummary) -> String {
    format!(
        "Task: {}\n\nTask summary:\n{}\nAssess every acceptance criterion.",
        summary.title,
        to_yaml(summary)
    )
}

/// Join system and user prompts for CLIs that take a single stdin document.
pub fn combined(system: &str, user: &str) -> String {
    format!("{}\n\n---\n\n{}", system.trim_end(), user)
}
