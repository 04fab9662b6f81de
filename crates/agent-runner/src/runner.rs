//! Task runner: drives one task from submission to a terminal state.
//!
//! Pending -> Planning -> Running (loop) -> Validating -> Complete, with
//! every failure ending in Failed. The sandbox is started once after the
//! PRD loads and stopped once on every path that started it; the report is
//! written last, after the context is finalized.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use runner_core::config::{absolutize, PrdSource};
use runner_core::protocol::{to_yaml, PlanTaskRequest, PlannerMessage};
use runner_core::tooling::{ToolCandidate, CATEGORY_WORKER};
use runner_core::{
    PlannerAction, PlannerCall, PlannerCallKind, ReportEmitter, TaskConfig, TaskContext, TaskError,
    TaskState, WorkerCall, WorkerRunResult,
};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executor::{ExecutorError, WorkerExecutor};
use crate::planner::{Planner, PlannerError};
use crate::selector::Selector;
use crate::verifier::Verifier;
use crate::worker_tools::{apply_candidate, is_worker_tool};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("planner {operation} failed: {source}")]
    PlannerTransport {
        operation: PlannerCallKind,
        #[source]
        source: PlannerError,
    },
    #[error("planner protocol error: {0}")]
    PlannerProtocol(String),
    #[error("planner aborted the task: {0}")]
    Aborted(String),
    #[error("planner did not mark the task complete within {0} iterations")]
    LoopCap(u32),
    #[error("sandbox startup failed: {0}")]
    SandboxStartup(#[source] ExecutorError),
    #[error("acceptance criteria not satisfied: {0}")]
    CriteriaNotSatisfied(String),
    #[error("task cancelled")]
    Cancelled,
    #[error("task context error: {0}")]
    Context(#[from] TaskError),
}

pub type Result<T> = std::result::Result<T, RunError>;

/// Finalized context plus the error that ended the run, if any.
#[derive(Debug)]
pub struct RunOutcome {
    pub context: TaskContext,
    pub error: Option<RunError>,
    pub report_path: Option<PathBuf>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.context.state() == TaskState::Complete
    }

    pub fn into_result(self) -> Result<TaskContext> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.context),
        }
    }
}

pub struct Runner {
    config: TaskConfig,
    planner: Arc<dyn Planner>,
    executor: Box<dyn WorkerExecutor>,
    reporter: Box<dyn ReportEmitter>,
    selector: Option<Arc<Selector>>,
    verifier: Verifier,
    max_loops: u32,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("task_id", &self.config.task.id)
            .field("max_loops", &self.max_loops)
            .finish_non_exhaustive()
    }
}

impl Runner {
    pub fn new(
        config: TaskConfig,
        planner: Arc<dyn Planner>,
        executor: Box<dyn WorkerExecutor>,
        reporter: Box<dyn ReportEmitter>,
    ) -> Self {
        let verifier = Verifier::from_test_config(&config.task.test);
        let max_loops = config.runner.effective_max_loops();
        Self {
            config,
            planner,
            executor,
            reporter,
            selector: None,
            verifier,
            max_loops,
        }
    }

    /// Worker candidates are drawn from `selector`'s `worker` category.
    pub fn with_selector(mut self, selector: Arc<Selector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Run the task to a terminal state. Never panics on task failure; the
    /// failure is carried in the outcome and in the context.
    pub async fn run(&mut self, cancel: &CancellationToken) -> RunOutcome {
        let repo = &self.config.task.repo;
        let repo_path = absolutize(repo).unwrap_or_else(|_| repo.clone());
        let mut ctx = TaskContext::new(
            self.config.task.id.clone(),
            self.config.task.title.clone(),
            repo_path,
        );
        info!(task_id = %ctx.id(), repo = %ctx.repo_path().display(), "task started");

        let mut sandbox_started = false;
        let error = self
            .drive(&mut ctx, &mut sandbox_started, cancel)
            .await
            .err();

        if let Some(err) = &error {
            if ctx.state() != TaskState::Failed {
                if let Err(fail_err) = ctx.fail(err.to_string()) {
                    warn!(task_id = %ctx.id(), error = %fail_err, "could not mark task failed");
                }
            }
            warn!(task_id = %ctx.id(), error = %err, "task failed");
        }

        if sandbox_started {
            self.teardown(&ctx).await;
        }

        if let Err(err) = ctx.finish() {
            warn!(task_id = %ctx.id(), error = %err, "could not finalize task");
        }
        info!(
            task_id = %ctx.id(),
            state = %ctx.state(),
            worker_runs = ctx.worker_runs().len(),
            "task finished"
        );

        let report_path = match self.reporter.write(&ctx) {
            Ok(path) => {
                info!(task_id = %ctx.id(), path = %path.display(), "report written");
                Some(path)
            }
            Err(err) => {
                warn!(task_id = %ctx.id(), error = %err, "failed to write report");
                None
            }
        };

        RunOutcome {
            context: ctx,
            error,
            report_path,
        }
    }

    async fn drive(
        &mut self,
        ctx: &mut TaskContext,
        sandbox_started: &mut bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let prd_text = self.load_prd(cancel).await?;
        ctx.load_prd(prd_text)?;
        advance(ctx, TaskState::Planning)?;

        if let Err(err) = self.executor.start(cancel).await {
            return Err(if cancel.is_cancelled() {
                RunError::Cancelled
            } else {
                RunError::SandboxStartup(err)
            });
        }
        *sandbox_started = true;
        info!(
            task_id = %ctx.id(),
            container_id = self.executor.container_id().unwrap_or("-"),
            "worker sandbox ready"
        );

        self.plan(ctx, cancel).await?;

        advance(ctx, TaskState::Running)?;
        self.execute(ctx, cancel).await?;

        advance(ctx, TaskState::Validating)?;
        self.validate(ctx, cancel).await?;

        self.verify(ctx, cancel).await?;
        Ok(())
    }

    async fn load_prd(&self, cancel: &CancellationToken) -> Result<String> {
        let path = match self.config.task.prd.source() {
            Some(PrdSource::Inline(text)) => return Ok(text),
            Some(PrdSource::File(path)) => path,
            None => return Err(RunError::Config("PRD not specified".to_string())),
        };

        debug!(path = %path.display(), "reading PRD file");
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunError::Cancelled),
            read = tokio::fs::read_to_string(&path) => read.map_err(|err| {
                RunError::Config(format!("failed to read PRD file {}: {err}", path.display()))
            })?,
        };
        if text.trim().is_empty() {
            return Err(RunError::Config(format!("PRD file {} is empty", path.display())));
        }
        Ok(text)
    }

    async fn plan(&self, ctx: &mut TaskContext, cancel: &CancellationToken) -> Result<()> {
        let request = envelope(
            "plan_task",
            &PlanTaskRequest {
                prd_text: ctx.prd_text().to_string(),
            },
        );
        let result = self.planner.plan_task(ctx.prd_text(), cancel).await;
        record(ctx, PlannerCallKind::Plan, request, "plan_task", &result)?;
        let plan = result.map_err(|err| planner_error(PlannerCallKind::Plan, err, cancel))?;

        ctx.set_criteria(&plan.acceptance_criteria)?;
        info!(
            task_id = %ctx.id(),
            criteria = plan.acceptance_criteria.len(),
            "acceptance criteria planned"
        );
        Ok(())
    }

    async fn execute(&self, ctx: &mut TaskContext, cancel: &CancellationToken) -> Result<()> {
        for iteration in 1..=self.max_loops {
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }

            let summary = ctx.summary();
            let request = envelope("next_action", &summary);
            let result = self.planner.next_action(&summary, cancel).await;
            record(ctx, PlannerCallKind::NextAction, request, "next_action", &result)?;
            let action =
                result.map_err(|err| planner_error(PlannerCallKind::NextAction, err, cancel))?;

            debug!(
                task_id = %ctx.id(),
                iteration,
                action = %action.decision.action,
                "planner decided"
            );
            match action.decision.action {
                PlannerAction::MarkComplete => return Ok(()),
                PlannerAction::RunWorker => {
                    self.dispatch_worker(ctx, action.worker_call.unwrap_or_default(), cancel)
                        .await?;
                }
                PlannerAction::Abort => {
                    let reason = action
                        .decision
                        .reason
                        .filter(|r| !r.trim().is_empty())
                        .unwrap_or_else(|| "no reason given".to_string());
                    return Err(RunError::Aborted(reason));
                }
                PlannerAction::Unknown(other) => {
                    return Err(RunError::PlannerProtocol(format!("unknown action: {other}")));
                }
            }
        }
        Err(RunError::LoopCap(self.max_loops))
    }

    async fn dispatch_worker(
        &self,
        ctx: &mut TaskContext,
        mut call: WorkerCall,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let candidate = self
            .selector
            .as_ref()
            .and_then(|selector| selector.select(CATEGORY_WORKER))
            .filter(|candidate| {
                let runnable = is_worker_tool(&candidate.tool);
                if !runnable {
                    debug!(
                        candidate = %candidate.key(),
                        "selected candidate is not a worker tool; keeping planner's call"
                    );
                }
                runnable
            });
        if let Some(candidate) = &candidate {
            debug!(candidate = %candidate.key(), "worker candidate selected");
            apply_candidate(&mut call, candidate);
        }

        let started_at = Utc::now();
        let run = match self
            .executor
            .run_worker(&call, &self.config.runner.worker.env, cancel)
            .await
        {
            Ok(run) => run,
            Err(err) => {
                warn!(task_id = %ctx.id(), error = %err, "worker call rejected");
                rejected_run(started_at, &err)
            }
        };

        if let Some(error) = &run.error {
            self.cool_down_worker(candidate.as_ref(), error);
        }
        ctx.record_worker_run(run)?;
        advance(ctx, TaskState::Running)
    }

    fn cool_down_worker(&self, candidate: Option<&ToolCandidate>, error: &str) {
        let (Some(selector), Some(candidate)) = (&self.selector, candidate) else {
            return;
        };
        if selector.report_failure(CATEGORY_WORKER, candidate, error) {
            warn!(candidate = %candidate.key(), "worker candidate rate limited; cooling down");
        }
    }

    async fn validate(&self, ctx: &mut TaskContext, cancel: &CancellationToken) -> Result<()> {
        let summary = ctx.summary();
        let request = envelope("completion_assessment", &summary);
        let result = self.planner.assess_completion(&summary, cancel).await;
        record(
            ctx,
            PlannerCallKind::AssessCompletion,
            request,
            "completion_assessment",
            &result,
        )?;
        let assessment =
            result.map_err(|err| planner_error(PlannerCallKind::AssessCompletion, err, cancel))?;

        ctx.apply_assessment(&assessment)?;
        if !assessment.all_criteria_satisfied {
            let summary = if assessment.summary.trim().is_empty() {
                "assessment reported unsatisfied criteria".to_string()
            } else {
                assessment.summary
            };
            return Err(RunError::CriteriaNotSatisfied(summary));
        }
        advance(ctx, TaskState::Complete)
    }

    /// Host verification. Observational: failures are logged, never fatal.
    async fn verify(&self, ctx: &mut TaskContext, cancel: &CancellationToken) -> Result<()> {
        if ctx.state() != TaskState::Complete || !self.verifier.has_command() {
            return Ok(());
        }
        match self.verifier.execute(ctx.repo_path(), cancel).await {
            Ok(Some(result)) => {
                if result.exit_code != 0 {
                    warn!(task_id = %ctx.id(), exit_code = result.exit_code, "verification failed");
                }
                ctx.set_verification(result)?;
            }
            Ok(None) => {}
            Err(err) => warn!(task_id = %ctx.id(), error = %err, "verification could not run"),
        }
        Ok(())
    }

    async fn teardown(&mut self, ctx: &TaskContext) {
        // The task token may already be cancelled; stop must still run.
        let cancel = CancellationToken::new();
        if let Err(err) = self.executor.stop(&cancel).await {
            warn!(task_id = %ctx.id(), error = %err, "sandbox teardown failed");
        }
    }
}

fn advance(ctx: &mut TaskContext, next: TaskState) -> Result<()> {
    let from = ctx.state();
    ctx.transition(next)?;
    if from != next {
        info!(task_id = %ctx.id(), from = %from, to = %next, "task state changed");
    }
    Ok(())
}

fn planner_error(
    operation: PlannerCallKind,
    err: PlannerError,
    cancel: &CancellationToken,
) -> RunError {
    match err {
        PlannerError::Cancelled => RunError::Cancelled,
        _ if cancel.is_cancelled() => RunError::Cancelled,
        PlannerError::Protocol(err) => RunError::PlannerProtocol(format!("{operation}: {err}")),
        source => RunError::PlannerTransport { operation, source },
    }
}

/// Render a planner body as a `{type, version, payload}` document.
fn envelope<T: Serialize>(kind: &str, payload: &T) -> String {
    match PlannerMessage::new(kind, payload) {
        Ok(message) => to_yaml(&message),
        Err(_) => to_yaml(payload),
    }
}

fn record<T: Serialize>(
    ctx: &mut TaskContext,
    kind: PlannerCallKind,
    request: String,
    response_type: &str,
    result: &std::result::Result<T, PlannerError>,
) -> Result<()> {
    let response = match result {
        Ok(response) => envelope(response_type, response),
        Err(err) => format!("error: {err}"),
    };
    ctx.record_planner_call(PlannerCall {
        kind,
        timestamp: Utc::now(),
        request,
        response,
    })?;
    Ok(())
}

/// Run entry for a worker call the executor refused before touching the
/// sandbox.
fn rejected_run(started_at: chrono::DateTime<Utc>, err: &ExecutorError) -> WorkerRunResult {
    let error = err.to_string();
    WorkerRunResult {
        id: format!("run-rejected-{}", Uuid::now_v7().simple()),
        started_at,
        finished_at: Utc::now(),
        exit_code: -1,
        raw_output: String::new(),
        summary: format!("Worker execution failed: {error}"),
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_core::protocol::ProtocolError;

    #[test]
    fn planner_errors_map_to_run_errors() {
        let live = CancellationToken::new();
        assert!(matches!(
            planner_error(PlannerCallKind::Plan, PlannerError::Transport("down".into()), &live),
            RunError::PlannerTransport {
                operation: PlannerCallKind::Plan,
                ..
            }
        ));
        assert!(matches!(
            planner_error(PlannerCallKind::NextAction, PlannerError::Cancelled, &live),
            RunError::Cancelled
        ));
        let protocol = ProtocolError::UnexpectedType {
            expected: "next_action",
            actual: "plan_task".to_string(),
        };
        let err = planner_error(PlannerCallKind::NextAction, PlannerError::Protocol(protocol), &live);
        assert!(matches!(err, RunError::PlannerProtocol(_)));

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(
            planner_error(PlannerCallKind::Plan, PlannerError::Transport("x".into()), &cancelled),
            RunError::Cancelled
        ));
    }

    #[test]
    fn envelope_wraps_payload() {
        let yaml = envelope(
            "plan_task",
            &PlanTaskRequest {
                prd_text: "Implement X".to_string(),
            },
        );
        assert!(yaml.contains("type: plan_task"));
        assert!(yaml.contains("version: 1"));
        assert!(yaml.contains("prd_text: Implement X"));
    }

    #[test]
    fn rejected_run_is_marked_failed() {
        let run = rejected_run(Utc::now(), &ExecutorError::NotStarted);
        assert!(run.failed());
        assert!(run.summary.starts_with("Worker execution failed"));
        assert_eq!(run.exit_code, -1);
    }

    #[test]
    fn transport_error_names_operation() {
        let err = RunError::PlannerTransport {
            operation: PlannerCallKind::NextAction,
            source: PlannerError::Transport("boom".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "planner next_action failed: planner transport error: boom"
        );
    }
}
