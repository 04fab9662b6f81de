//! Markdown task report.
//!
//! Writes `<repo>/.agent-runner/task-<id>.md` once a task is finalized.
//! The directory is created owner-only (0700) on unix.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::types::TaskContext;

pub const REPORT_DIR: &str = ".agent-runner";

/// Persists a finished task context.
pub trait ReportEmitter: Send + Sync {
    fn write(&self, ctx: &TaskContext) -> std::io::Result<PathBuf>;
}

/// Report path for a task under `repo`.
pub fn report_path(repo: &Path, task_id: &str) -> PathBuf {
    repo.join(REPORT_DIR).join(format!("task-{task_id}.md"))
}

/// Writes the Markdown report into the task's repository.
#[derive(Debug, Clone, Default)]
pub struct MarkdownReporter;

impl MarkdownReporter {
    pub fn new() -> Self {
        Self
    }
}

impl ReportEmitter for MarkdownReporter {
    fn write(&self, ctx: &TaskContext) -> std::io::Result<PathBuf> {
        let dir = ctx.repo_path().join(REPORT_DIR);
        create_private_dir(&dir)?;

        let path = report_path(ctx.repo_path(), ctx.id());
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(render(ctx).as_bytes())?;
        writer.flush()?;
        Ok(path)
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;
    // An existing directory keeps its old mode unless tightened here.
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Code fence long enough that `content` cannot close it early.
fn fence_for(content: &str) -> String {
    let mut longest = 0;
    let mut run = 0;
    for ch in content.chars() {
        if ch == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    "`".repeat(longest.max(2) + 1)
}

fn push_block(out: &mut String, lang: &str, content: &str) {
    let fence = fence_for(content);
    let _ = writeln!(out, "{fence}{lang}");
    out.push_str(content.trim_end_matches('\n'));
    out.push('\n');
    let _ = writeln!(out, "{fence}");
    out.push('\n');
}

/// Render the report body.
pub fn render(ctx: &TaskContext) -> String {
    let mut out = String::new();

    if ctx.title().is_empty() {
        let _ = writeln!(out, "# Task Report - {}\n", ctx.id());
    } else {
        let _ = writeln!(out, "# Task Report - {} - {}\n", ctx.id(), ctx.title());
    }
    let _ = writeln!(out, "- Task ID: {}", ctx.id());
    let _ = writeln!(out, "- Title: {}", ctx.title());
    let _ = writeln!(out, "- Repository: {}", ctx.repo_path().display());
    let _ = writeln!(out, "- Started At: {}", timestamp(ctx.started_at()));
    let finished = ctx
        .finished_at()
        .map_or_else(|| "-".to_string(), timestamp);
    let _ = writeln!(out, "- Finished At: {finished}");
    let _ = writeln!(out, "- State: {}", ctx.state());
    if let Some(reason) = ctx.failure() {
        let _ = writeln!(out, "- Failure: {}", reason.replace('\n', " "));
    }
    out.push_str("\n---\n\n## 1. PRD Summary\n\n");
    push_block(&mut out, "text", ctx.prd_text());

    out.push_str("---\n\n## 2. Acceptance Criteria\n\n");
    if ctx.acceptance_criteria().is_empty() {
        out.push_str("_No acceptance criteria were planned._\n");
    }
    for criterion in ctx.acceptance_criteria() {
        let mark = if criterion.passed { 'x' } else { ' ' };
        let _ = writeln!(
            out,
            "- [{mark}] {}: {}",
            criterion.id, criterion.description
        );
    }

    out.push_str("\n---\n\n## 3. Execution Log\n\n### 3.1 Planner Calls\n\n");
    if ctx.planner_calls().is_empty() {
        out.push_str("_None._\n\n");
    }
    for call in ctx.planner_calls() {
        let _ = writeln!(out, "#### {} at {}\n", call.kind, timestamp(call.timestamp));
        out.push_str("Request:\n\n");
        push_block(&mut out, "yaml", &call.request);
        out.push_str("Response:\n\n");
        push_block(&mut out, "yaml", &call.response);
    }

    out.push_str("### 3.2 Worker Runs\n\n");
    if ctx.worker_runs().is_empty() {
        out.push_str("_None._\n\n");
    }
    for run in ctx.worker_runs() {
        let _ = writeln!(out, "#### Run {} (exit code {})\n", run.id, run.exit_code);
        let _ = writeln!(out, "- Started At: {}", timestamp(run.started_at));
        let _ = writeln!(out, "- Finished At: {}", timestamp(run.finished_at));
        let _ = writeln!(out, "- Summary: {}", run.summary);
        if let Some(error) = &run.error {
            let _ = writeln!(out, "- Error: {error}");
        }
        out.push('\n');
        push_block(&mut out, "text", &run.raw_output);
    }

    out.push_str("### 3.3 Test Results\n\n");
    match ctx.verification() {
        Some(verification) => {
            let _ = writeln!(out, "- Command: `{}`", verification.command);
            let _ = writeln!(out, "- Cwd: {}", verification.cwd.display());
            let _ = writeln!(out, "- Exit Code: {}", verification.exit_code);
            let _ = writeln!(out, "- Summary: {}\n", verification.summary);
            push_block(&mut out, "text", &verification.raw_output);
        }
        None => out.push_str("_Not run._\n"),
    }

    out
}
