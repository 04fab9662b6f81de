//! Planner that routes each call through the tool selector.
//!
//! `plan_task` draws from the `task` category, `next_action` and
//! `assess_completion` from `execution`; the profile falls back to `meta`
//! for either. When a candidate is rate limited and its category opts into
//! fallback, the candidate cools down and the same call moves to the next
//! one, at most once per configured candidate. The meta planner serves the
//! call once no candidate is left. A forced candidate is called directly.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use runner_core::config::MetaConfig;
use runner_core::tooling::{ToolCandidate, CATEGORY_EXECUTION, CATEGORY_TASK};
use runner_core::{CompletionAssessment, NextActionResponse, PlanTaskResponse, TaskSummary};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{build_planner, Planner, PlannerError, PlannerSpec, Result};
use crate::selector::Selector;

/// Builds a planner for a selected candidate.
pub trait PlannerFactory: Send + Sync {
    fn build(&self, candidate: &ToolCandidate) -> Result<Arc<dyn Planner>>;
}

/// Default factory: candidate settings over the meta config.
#[derive(Debug, Clone)]
pub struct CandidatePlannerFactory {
    meta: MetaConfig,
}

impl CandidatePlannerFactory {
    pub fn new(meta: MetaConfig) -> Self {
        Self { meta }
    }
}

impl PlannerFactory for CandidatePlannerFactory {
    fn build(&self, candidate: &ToolCandidate) -> Result<Arc<dyn Planner>> {
        build_planner(&PlannerSpec::from_candidate(candidate, &self.meta))
    }
}

pub struct ToolingPlanner {
    selector: Arc<Selector>,
    factory: Box<dyn PlannerFactory>,
    fallback: Arc<dyn Planner>,
}

impl std::fmt::Debug for ToolingPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolingPlanner")
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

impl ToolingPlanner {
    /// `fallback` serves calls when no candidate is eligible.
    pub fn new(
        selector: Arc<Selector>,
        factory: impl PlannerFactory + 'static,
        fallback: Arc<dyn Planner>,
    ) -> Self {
        Self {
            selector,
            factory: Box::new(factory),
            fallback,
        }
    }

    fn build(&self, category: &str, candidate: &ToolCandidate) -> Option<Arc<dyn Planner>> {
        match self.factory.build(candidate) {
            Ok(planner) => {
                debug!(category, candidate = %candidate.key(), "planner candidate resolved");
                Some(planner)
            }
            Err(err) => {
                warn!(
                    category,
                    candidate = %candidate.key(),
                    error = %err,
                    "failed to build planner for candidate"
                );
                None
            }
        }
    }

    async fn dispatch<T, F, Fut>(&self, category: &str, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn Planner>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        if let Some(forced) = self.selector.config().forced_candidate() {
            if let Some(planner) = self.build(category, &forced) {
                return call(planner).await;
            }
        } else {
            for _ in 0..self.selector.candidate_count(category) {
                let Some(candidate) = self.selector.select(category) else {
                    break;
                };
                let Some(planner) = self.build(category, &candidate) else {
                    continue;
                };
                let err = match call(planner).await {
                    Ok(value) => return Ok(value),
                    Err(err) => err,
                };
                if matches!(err, PlannerError::Cancelled)
                    || !self.selector.report_failure(category, &candidate, &err.to_string())
                {
                    return Err(err);
                }
                warn!(
                    category,
                    candidate = %candidate.key(),
                    "planner candidate rate limited; switching candidate"
                );
            }
        }

        debug!(category, "no planner candidate left; using meta planner");
        call(Arc::clone(&self.fallback)).await
    }
}

#[async_trait]
impl Planner for ToolingPlanner {
    async fn plan_task(&self, prd_text: &str, cancel: &CancellationToken) -> Result<PlanTaskResponse> {
        self.dispatch(CATEGORY_TASK, |planner| async move {
            planner.plan_task(prd_text, cancel).await
        })
        .await
    }

    async fn next_action(
        &self,
        summary: &TaskSummary,
        cancel: &CancellationToken,
    ) -> Result<NextActionResponse> {
        self.dispatch(CATEGORY_EXECUTION, |planner| async move {
            planner.next_action(summary, cancel).await
        })
        .await
    }

    async fn assess_completion(
        &self,
        summary: &TaskSummary,
        cancel: &CancellationToken,
    ) -> Result<CompletionAssessment> {
        self.dispatch(CATEGORY_EXECUTION, |planner| async move {
            planner.assess_completion(summary, cancel).await
        })
        .await
    }
}
