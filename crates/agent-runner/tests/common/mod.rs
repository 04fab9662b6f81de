//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use agent_runner::executor::SandboxExecutor;
use agent_runner::planner::{Planner, PlannerError};
use agent_runner::sandbox::{ExecOutput, SandboxError, SandboxProvider, SandboxSpec};
use agent_runner::Runner;
use async_trait::async_trait;
use runner_core::protocol::{CriterionStatus, CriterionVerdict, Decision, PlannedCriterion};
use runner_core::{
    CompletionAssessment, NextActionResponse, PlanTaskResponse, PlannerAction, ReportEmitter,
    TaskConfig, TaskContext, TaskState, TaskSummary, WorkerCall,
};
use tokio_util::sync::CancellationToken;

// --- planner ---

type Reply<T> = Result<T, PlannerError>;

/// Planner that replays queued replies and records what it was asked.
#[derive(Default)]
pub struct ScriptedPlanner {
    plans: Mutex<VecDeque<Reply<PlanTaskResponse>>>,
    actions: Mutex<VecDeque<Reply<NextActionResponse>>>,
    assessments: Mutex<VecDeque<Reply<CompletionAssessment>>>,
    pub calls: Mutex<Vec<&'static str>>,
    pub summaries: Mutex<Vec<TaskSummary>>,
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(self, reply: Reply<PlanTaskResponse>) -> Self {
        self.plans.lock().unwrap().push_back(reply);
        self
    }

    pub fn action(self, reply: Reply<NextActionResponse>) -> Self {
        self.actions.lock().unwrap().push_back(reply);
        self
    }

    pub fn assessment(self, reply: Reply<CompletionAssessment>) -> Self {
        self.assessments.lock().unwrap().push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn next<T>(
        &self,
        name: &'static str,
        queue: &Mutex<VecDeque<Reply<T>>>,
        cancel: &CancellationToken,
    ) -> Reply<T> {
        self.calls.lock().unwrap().push(name);
        if cancel.is_cancelled() {
            return Err(PlannerError::Cancelled);
        }
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PlannerError::Transport(format!("{name}: script exhausted"))))
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan_task(&self, _prd_text: &str, cancel: &CancellationToken) -> Reply<PlanTaskResponse> {
        self.next("plan_task", &self.plans, cancel)
    }

    async fn next_action(
        &self,
        summary: &TaskSummary,
        cancel: &CancellationToken,
    ) -> Reply<NextActionResponse> {
        self.summaries.lock().unwrap().push(summary.clone());
        self.next("next_action", &self.actions, cancel)
    }

    async fn assess_completion(
        &self,
        summary: &TaskSummary,
        cancel: &CancellationToken,
    ) -> Reply<CompletionAssessment> {
        self.summaries.lock().unwrap().push(summary.clone());
        self.next("assess_completion", &self.assessments, cancel)
    }
}

/// Forwards to a shared planner so tests keep a handle for assertions.
pub struct Shared(pub Arc<ScriptedPlanner>);

#[async_trait]
impl Planner for Shared {
    async fn plan_task(&self, prd_text: &str, cancel: &CancellationToken) -> Reply<PlanTaskResponse> {
        self.0.plan_task(prd_text, cancel).await
    }

    async fn next_action(
        &self,
        summary: &TaskSummary,
        cancel: &CancellationToken,
    ) -> Reply<NextActionResponse> {
        self.0.next_action(summary, cancel).await
    }

    async fn assess_completion(
        &self,
        summary: &TaskSummary,
        cancel: &CancellationToken,
    ) -> Reply<CompletionAssessment> {
        self.0.assess_completion(summary, cancel).await
    }
}

pub fn plan(ids: &[&str]) -> Reply<PlanTaskResponse> {
    Ok(PlanTaskResponse {
        task_id: "T".to_string(),
        acceptance_criteria: ids
            .iter()
            .map(|id| PlannedCriterion {
                id: (*id).to_string(),
                description: format!("criterion {id}"),
                kind: None,
                critical: true,
            })
            .collect(),
    })
}

pub fn run_worker(prompt: &str) -> Reply<NextActionResponse> {
    Ok(NextActionResponse {
        decision: Decision {
            action: PlannerAction::RunWorker,
            reason: None,
        },
        worker_call: Some(WorkerCall {
            worker_type: "mock".to_string(),
            mode: "exec".to_string(),
            prompt: prompt.to_string(),
            ..WorkerCall::default()
        }),
    })
}

pub fn decide(action: PlannerAction, reason: Option<&str>) -> Reply<NextActionResponse> {
    Ok(NextActionResponse {
        decision: Decision {
            action,
            reason: reason.map(str::to_string),
        },
        worker_call: None,
    })
}

pub fn mark_complete() -> Reply<NextActionResponse> {
    decide(PlannerAction::MarkComplete, None)
}

pub fn assessment(satisfied: bool, verdicts: &[(&str, CriterionStatus)]) -> Reply<CompletionAssessment> {
    Ok(CompletionAssessment {
        all_criteria_satisfied: satisfied,
        summary: if satisfied { "all good" } else { "not there yet" }.to_string(),
        by_criterion: verdicts
            .iter()
            .map(|(id, status)| CriterionVerdict {
                id: (*id).to_string(),
                status: *status,
                comment: String::new(),
            })
            .collect(),
    })
}

pub fn transport_error(message: &str) -> PlannerError {
    PlannerError::Transport(message.to_string())
}

// --- sandbox ---

/// Sandbox that records lifecycle calls and replays exec results.
#[derive(Default)]
pub struct RecordingSandbox {
    pub fail_start: bool,
    pub starts: Mutex<Vec<SandboxSpec>>,
    pub stops: Mutex<Vec<String>>,
    pub execs: Mutex<Vec<Vec<String>>>,
    exec_results: Mutex<VecDeque<Result<ExecOutput, String>>>,
    cancel_on_exec: Option<CancellationToken>,
}

impl RecordingSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    /// Cancel `token` once the first exec returns.
    pub fn cancelling(token: CancellationToken) -> Self {
        Self {
            cancel_on_exec: Some(token),
            ..Self::default()
        }
    }

    /// Queue an exec result; unqueued execs succeed with "ok".
    pub fn exec_result(self, result: Result<ExecOutput, String>) -> Self {
        self.exec_results.lock().unwrap().push_back(result);
        self
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.lock().unwrap().len()
    }

    pub fn execs(&self) -> Vec<Vec<String>> {
        self.execs.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxProvider for RecordingSandbox {
    async fn start(&self, spec: &SandboxSpec, _cancel: &CancellationToken) -> Result<String, SandboxError> {
        self.starts.lock().unwrap().push(spec.clone());
        if self.fail_start {
            return Err(SandboxError::PullFailed {
                image: spec.image.clone(),
                reason: "registry unreachable".to_string(),
            });
        }
        Ok("container-1".to_string())
    }

    async fn exec(
        &self,
        _container_id: &str,
        argv: &[String],
        _stdin: Option<String>,
        _cancel: &CancellationToken,
    ) -> Result<ExecOutput, SandboxError> {
        self.execs.lock().unwrap().push(argv.to_vec());
        if let Some(token) = &self.cancel_on_exec {
            token.cancel();
        }
        match self.exec_results.lock().unwrap().pop_front() {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(SandboxError::Exec(message)),
            None => Ok(ExecOutput {
                exit_code: 0,
                output: "ok\n".to_string(),
            }),
        }
    }

    async fn stop(&self, container_id: &str, _cancel: &CancellationToken) -> Result<(), SandboxError> {
        self.stops.lock().unwrap().push(container_id.to_string());
        Ok(())
    }
}

// --- reporter ---

/// Keeps finished contexts in memory.
#[derive(Clone, Default)]
pub struct MemoryReporter {
    pub written: Arc<Mutex<Vec<TaskContext>>>,
    pub fail: bool,
}

impl MemoryReporter {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn states(&self) -> Vec<TaskState> {
        self.written.lock().unwrap().iter().map(TaskContext::state).collect()
    }
}

impl ReportEmitter for MemoryReporter {
    fn write(&self, ctx: &TaskContext) -> std::io::Result<PathBuf> {
        if self.fail {
            return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"));
        }
        self.written.lock().unwrap().push(ctx.clone());
        Ok(PathBuf::from(format!("memory://{}", ctx.id())))
    }
}

// --- wiring ---

/// Task config rooted at `repo`; the extras are spliced under `task:` and
/// `runner:` respectively.
pub fn config(repo: &Path, task_extra: &str, runner_extra: &str) -> TaskConfig {
    let yaml = format!(
        "version: 1\ntask:\n  id: task-1\n  title: Scenario\n  repo: {}\n{task_extra}runner:\n  worker:\n    kind: mock\n{runner_extra}",
        repo.display()
    );
    TaskConfig::from_yaml_str(&yaml).unwrap()
}

/// Config with inline PRD "Implement X".
pub fn inline_config(repo: &Path) -> TaskConfig {
    config(repo, "  prd:\n    text: Implement X\n", "")
}

pub fn runner(
    config: TaskConfig,
    planner: &Arc<ScriptedPlanner>,
    sandbox: &Arc<RecordingSandbox>,
    reporter: impl ReportEmitter + 'static,
) -> Runner {
    let executor = SandboxExecutor::new(
        config.runner.worker.clone(),
        config.task.repo.clone(),
        Arc::clone(sandbox) as Arc<dyn SandboxProvider>,
    );
    Runner::new(
        config,
        Arc::new(Shared(Arc::clone(planner))),
        Box::new(executor),
        Box::new(reporter),
    )
}
