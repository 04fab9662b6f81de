//! agent-runner - task orchestration engine
//!
//! Drives a single task description through planning, sandboxed worker
//! runs and validation. The binary reads the task YAML on stdin; this
//! library holds the collaborators so tests can swap any of them.

pub mod executor;
pub mod planner;
pub mod process;
pub mod runner;
pub mod sandbox;
pub mod selector;
pub mod verifier;
pub mod worker_tools;

use std::sync::Arc;

use runner_core::{MarkdownReporter, TaskConfig};
use tracing::info;

use executor::SandboxExecutor;
use planner::{build_planner, CandidatePlannerFactory, Planner, PlannerError, PlannerSpec, ToolingPlanner};
use sandbox::DockerSandbox;
use selector::Selector;

pub use runner::{RunError, RunOutcome, Runner};

/// Wire the production collaborators for `config`: the configured planner
/// (tool-selecting when a tooling profile is present), a Docker-backed
/// executor and the Markdown reporter.
pub fn build_runner(config: TaskConfig) -> Result<Runner, PlannerError> {
    let meta_spec = PlannerSpec::from_meta(&config.runner.meta);
    let meta_planner = build_planner(&meta_spec)?;
    let selector = config
        .runner
        .tooling
        .clone()
        .map(|tooling| Arc::new(Selector::new(tooling)));

    let planner: Arc<dyn Planner> = match &selector {
        Some(selector) => {
            info!(meta = %meta_spec.tool, "tooling profile enabled");
            Arc::new(ToolingPlanner::new(
                Arc::clone(selector),
                CandidatePlannerFactory::new(config.runner.meta.clone()),
                meta_planner,
            ))
        }
        None => {
            info!(meta = %meta_spec.tool, model = %meta_spec.model, "planner configured");
            meta_planner
        }
    };

    let executor = SandboxExecutor::new(
        config.runner.worker.clone(),
        config.task.repo.clone(),
        Arc::new(DockerSandbox::new()),
    );
    let runner = Runner::new(
        config,
        planner,
        Box::new(executor),
        Box::new(MarkdownReporter::new()),
    );
    Ok(match selector {
        Some(selector) => runner.with_selector(selector),
        None => runner,
    })
}
