//! Core task types.
//!
//! `TaskContext` is the in-memory record of one task's life. Its fields are
//! private: every mutation goes through a method that checks the lifecycle
//! rules (legal transitions, terminal immutability, criteria ownership).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::protocol::{
    CompletionAssessment, CriterionSnapshot, CriterionStatus, PlannedCriterion, TaskSummary,
    WorkerRunDigest,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },
    #[error("task {0} is finalized and can no longer change")]
    Finalized(String),
    #[error("cannot {action} while task is {state}")]
    WrongState {
        action: &'static str,
        state: TaskState,
    },
    #[error("PRD text must be loaded before planning")]
    MissingPrd,
    #[error("acceptance criteria were already planned")]
    CriteriaAlreadyPlanned,
    #[error("task is not in a terminal state ({0})")]
    NotTerminal(TaskState),
}

pub type Result<T> = std::result::Result<T, TaskError>;

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Planning,
    Running,
    Validating,
    Complete,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Planning => "PLANNING",
            Self::Running => "RUNNING",
            Self::Validating => "VALIDATING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Whether `next` is a legal edge from this state.
    ///
    /// `Running -> Running` is the `run_worker` self-loop.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::{Complete, Failed, Pending, Planning, Running, Validating};
        matches!(
            (self, next),
            (Pending | Planning | Running | Validating, Failed)
                | (Pending, Planning)
                | (Planning | Running, Running)
                | (Running, Validating)
                | (Validating, Complete)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single acceptance criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub id: String,
    pub description: String,
    pub passed: bool,
}

/// Which planner operation produced a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerCallKind {
    Plan,
    NextAction,
    AssessCompletion,
}

impl PlannerCallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::NextAction => "next_action",
            Self::AssessCompletion => "assess_completion",
        }
    }
}

impl std::fmt::Display for PlannerCallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit log entry for one planner round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerCall {
    pub kind: PlannerCallKind,
    pub timestamp: DateTime<Utc>,
    /// Request body rendered as YAML.
    pub request: String,
    /// Response body rendered as YAML, or the error text when the call failed.
    pub response: String,
}

/// Outcome of one worker invocation inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRunResult {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub exit_code: i32,
    pub raw_output: String,
    pub summary: String,
    pub error: Option<String>,
}

impl WorkerRunResult {
    pub fn failed(&self) -> bool {
        self.error.is_some() || self.exit_code != 0
    }
}

/// Host-side verification command outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub command: String,
    pub cwd: PathBuf,
    pub exit_code: i32,
    pub summary: String,
    pub raw_output: String,
}

/// In-memory record of a single task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskContext {
    id: String,
    title: String,
    repo_path: PathBuf,
    state: TaskState,
    prd_text: String,
    acceptance_criteria: Vec<AcceptanceCriterion>,
    planner_calls: Vec<PlannerCall>,
    worker_runs: Vec<WorkerRunResult>,
    verification: Option<VerificationResult>,
    failure: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TaskContext {
    pub fn new(id: impl Into<String>, title: impl Into<String>, repo_path: PathBuf) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            repo_path,
            state: TaskState::Pending,
            prd_text: String::new(),
            acceptance_criteria: Vec::new(),
            planner_calls: Vec::new(),
            worker_runs: Vec::new(),
            verification: None,
            failure: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn prd_text(&self) -> &str {
        &self.prd_text
    }

    pub fn acceptance_criteria(&self) -> &[AcceptanceCriterion] {
        &self.acceptance_criteria
    }

    pub fn planner_calls(&self) -> &[PlannerCall] {
        &self.planner_calls
    }

    pub fn worker_runs(&self) -> &[WorkerRunResult] {
        &self.worker_runs
    }

    pub fn verification(&self) -> Option<&VerificationResult> {
        self.verification.as_ref()
    }

    /// Reason recorded for a `FAILED` outcome.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_finalized(&self) -> bool {
        self.finished_at.is_some()
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.is_finalized() {
            return Err(TaskError::Finalized(self.id.clone()));
        }
        Ok(())
    }

    fn ensure_state(&self, action: &'static str, expected: TaskState) -> Result<()> {
        if self.state != expected {
            return Err(TaskError::WrongState {
                action,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Store the requirements text. Only allowed while pending.
    pub fn load_prd(&mut self, text: impl Into<String>) -> Result<()> {
        self.ensure_mutable()?;
        self.ensure_state("load the PRD", TaskState::Pending)?;
        self.prd_text = text.into();
        Ok(())
    }

    /// Move to `next`, rejecting edges outside the lifecycle graph.
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        self.ensure_mutable()?;
        if !self.state.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        if next == TaskState::Planning && self.prd_text.trim().is_empty() {
            return Err(TaskError::MissingPrd);
        }
        self.state = next;
        Ok(())
    }

    /// Move to `FAILED` and remember why. Only the first reason is kept.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_mutable()?;
        if self.state != TaskState::Failed {
            self.transition(TaskState::Failed)?;
        }
        if self.failure.is_none() {
            self.failure = Some(reason.into());
        }
        Ok(())
    }

    /// Copy planned criteria in with `passed = false`.
    pub fn set_criteria(&mut self, planned: &[PlannedCriterion]) -> Result<()> {
        self.ensure_mutable()?;
        self.ensure_state("record acceptance criteria", TaskState::Planning)?;
        if !self.acceptance_criteria.is_empty() {
            return Err(TaskError::CriteriaAlreadyPlanned);
        }
        self.acceptance_criteria = planned
            .iter()
            .map(|c| AcceptanceCriterion {
                id: c.id.clone(),
                description: c.description.clone(),
                passed: false,
            })
            .collect();
        Ok(())
    }

    pub fn record_planner_call(&mut self, call: PlannerCall) -> Result<()> {
        self.ensure_mutable()?;
        self.planner_calls.push(call);
        Ok(())
    }

    pub fn record_worker_run(&mut self, run: WorkerRunResult) -> Result<()> {
        self.ensure_mutable()?;
        self.ensure_state("record a worker run", TaskState::Running)?;
        self.worker_runs.push(run);
        Ok(())
    }

    /// Write per-criterion verdicts back into the `passed` flags.
    ///
    /// Criteria the assessment does not mention are left untouched.
    pub fn apply_assessment(&mut self, assessment: &CompletionAssessment) -> Result<()> {
        self.ensure_mutable()?;
        self.ensure_state("apply an assessment", TaskState::Validating)?;
        for verdict in &assessment.by_criterion {
            if let Some(criterion) = self
                .acceptance_criteria
                .iter_mut()
                .find(|c| c.id == verdict.id)
            {
                criterion.passed = verdict.status == CriterionStatus::Passed;
            }
        }
        Ok(())
    }

    pub fn set_verification(&mut self, result: VerificationResult) -> Result<()> {
        self.ensure_mutable()?;
        self.ensure_state("record verification", TaskState::Complete)?;
        self.verification = Some(result);
        Ok(())
    }

    /// Stamp `finished_at`. Requires a terminal state; succeeds once.
    pub fn finish(&mut self) -> Result<DateTime<Utc>> {
        self.ensure_mutable()?;
        if !self.state.is_terminal() {
            return Err(TaskError::NotTerminal(self.state));
        }
        let now = Utc::now();
        self.finished_at = Some(now);
        Ok(now)
    }

    /// Snapshot handed to the planner.
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            title: self.title.clone(),
            state: self.state,
            acceptance_criteria: self
                .acceptance_criteria
                .iter()
                .map(|c| CriterionSnapshot {
                    id: c.id.clone(),
                    description: c.description.clone(),
                    passed: c.passed,
                })
                .collect(),
            worker_runs_count: self.worker_runs.len(),
            worker_runs: self
                .worker_runs
                .iter()
                .map(|r| WorkerRunDigest {
                    id: r.id.clone(),
                    exit_code: r.exit_code,
                    summary: r.summary.clone(),
                    error: r.error.clone(),
                })
                .collect(),
        }
    }
}
