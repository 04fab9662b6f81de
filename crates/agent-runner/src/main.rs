//! agent-runner - run one task description to completion
//!
//! Reads the task YAML on stdin, prints the report path on stdout and
//! exits non-zero unless the task completes.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::process::ExitCode;

use agent_runner::{build_runner, RunOutcome};
use clap::Parser;
use eyre::{Result, WrapErr};
use runner_core::TaskConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "agent-runner",
    about = "Drive a task (YAML on stdin) through planner, sandboxed worker and validation",
    version
)]
struct Cli {
    /// Planner model; overrides runner.meta.model
    #[arg(long, env = "AGENT_RUNNER_META_MODEL")]
    meta_model: Option<String>,

    /// Execution-loop cap; overrides runner.max_loops
    #[arg(long)]
    max_loops: Option<u32>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries only the report path.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = TaskConfig::from_reader(std::io::stdin().lock())
        .wrap_err("failed to read task description from stdin")?;
    config.apply_meta_model_override(cli.meta_model.as_deref());
    if let Some(max_loops) = cli.max_loops {
        config.runner.max_loops = max_loops;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;
    let outcome = runtime.block_on(run(config))?;

    if let Some(path) = &outcome.report_path {
        println!("{}", path.display());
    }
    if outcome.succeeded() {
        return Ok(ExitCode::SUCCESS);
    }
    match &outcome.error {
        Some(err) => error!("task failed: {err}"),
        None => error!("task ended in state {}", outcome.context.state()),
    }
    Ok(ExitCode::FAILURE)
}

async fn run(config: TaskConfig) -> Result<RunOutcome> {
    let mut runner = build_runner(config).wrap_err("failed to configure runner")?;

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(cancel_on_signal(cancel.clone()));
    let outcome = runner.run(&cancel).await;
    signals.abort();
    Ok(outcome)
}

#[cfg(unix)]
async fn cancel_on_signal(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            warn!("failed to register signal handlers: {e}");
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, cancelling task"),
        _ = sigterm.recv() => info!("received SIGTERM, cancelling task"),
    }
    cancel.cancel();
}

#[cfg(not(unix))]
async fn cancel_on_signal(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received Ctrl-C, cancelling task");
        cancel.cancel();
    }
}
