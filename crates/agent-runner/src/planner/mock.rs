//! Deterministic planner used for dry runs and tests.
//!
//! Plans a single criterion, asks for one worker run, then marks the task
//! complete and passes every criterion.

use async_trait::async_trait;
use runner_core::protocol::{
    CriterionStatus, CriterionVerdict, Decision, PlannedCriterion, PlannerAction,
};
use runner_core::{CompletionAssessment, NextActionResponse, PlanTaskResponse, TaskSummary, WorkerCall};
use tokio_util::sync::CancellationToken;

use super::{Planner, PlannerError, Result};

#[derive(Debug, Clone, Default)]
pub struct MockPlanner;

impl MockPlanner {
    pub fn new() -> Self {
        Self
    }
}

fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(PlannerError::Cancelled);
    }
    Ok(())
}

#[async_trait]
impl Planner for MockPlanner {
    async fn plan_task(&self, _prd_text: &str, cancel: &CancellationToken) -> Result<PlanTaskResponse> {
        check(cancel)?;
        Ok(PlanTaskResponse {
            task_id: "mock-task".to_string(),
            acceptance_criteria: vec![PlannedCriterion {
                id: "AC-1".to_string(),
                description: "Mock acceptance criterion".to_string(),
                kind: Some("mock".to_string()),
                critical: true,
            }],
        })
    }

    async fn next_action(
        &self,
        summary: &TaskSummary,
        cancel: &CancellationToken,
    ) -> Result<NextActionResponse> {
        check(cancel)?;
        if summary.worker_runs_count == 0 {
            return Ok(NextActionResponse {
                decision: Decision {
                    action: PlannerAction::RunWorker,
                    reason: Some("no worker run yet".to_string()),
                },
                worker_call: Some(WorkerCall {
                    worker_type: "mock".to_string(),
                    mode: "exec".to_string(),
                    prompt: "Hello from the mock worker".to_string(),
                    ..WorkerCall::default()
                }),
            });
        }
        Ok(NextActionResponse {
            decision: Decision {
                action: PlannerAction::MarkComplete,
                reason: Some("worker ran".to_string()),
            },
            worker_call: None,
        })
    }

    async fn assess_completion(
        &self,
        summary: &TaskSummary,
        cancel: &CancellationToken,
    ) -> Result<CompletionAssessment> {
        check(cancel)?;
        Ok(CompletionAssessment {
            all_criteria_satisfied: true,
            summary: "All criteria satisfied (mock)".to_string(),
            by_criterion: summary
                .acceptance_criteria
                .iter()
                .map(|c| CriterionVerdict {
                    id: c.id.clone(),
                    status: CriterionStatus::Passed,
                    comment: "mock".to_string(),
                })
                .collect(),
        })
    }
}
