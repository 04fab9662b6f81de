//! Worker command lines per agent CLI.
//!
//! Only `exec` mode exists today; an empty mode means `exec`.

use std::collections::BTreeMap;

use runner_core::tooling::ToolCandidate;
use runner_core::WorkerCall;
use thiserror::Error;

use crate::sandbox::WORKSPACE_MOUNT;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerToolError {
    #[error("unsupported worker tool: {0}")]
    UnsupportedTool(String),
    #[error("unsupported worker mode: {0}")]
    UnsupportedMode(String),
    #[error("worker prompt is empty")]
    EmptyPrompt,
}

/// Argv plus optional stdin for one worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInvocation {
    pub argv: Vec<String>,
    pub stdin: Option<String>,
}

/// Tools `build_invocation` knows how to run inside the sandbox.
pub const WORKER_TOOLS: [&str; 4] = ["codex-cli", "claude-code", "gemini-cli", "mock"];

/// True for worker tools and their short aliases. Planner-only tools such
/// as `openai-chat` are not workers.
pub fn is_worker_tool(tool: &str) -> bool {
    matches!(
        tool.trim(),
        "codex-cli"
            | "codex"
            | "claude-code"
            | "claude-code-cli"
            | "claude"
            | "gemini-cli"
            | "gemini"
            | "mock"
    )
}

/// Fill call fields left empty from a selected candidate; the candidate's
/// tool always wins.
pub fn apply_candidate(call: &mut WorkerCall, candidate: &ToolCandidate) {
    call.worker_type.clone_from(&candidate.tool);
    if let Some(model) = candidate.model.as_ref().filter(|m| !m.is_empty()) {
        call.model = Some(model.clone());
    }
    if candidate.cli_path.is_some() {
        call.cli_path.clone_from(&candidate.cli_path);
    }
    call.flags.extend(candidate.flags.iter().cloned());
    for (key, value) in &candidate.env {
        call.env.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

/// Build the in-sandbox command for `call`. `default_tool` applies when the
/// call names none.
pub fn build_invocation(
    call: &WorkerCall,
    default_tool: &str,
    env: &BTreeMap<String, String>,
) -> Result<WorkerInvocation, WorkerToolError> {
    let mode = call.mode.trim();
    if !mode.is_empty() && mode != "exec" {
        return Err(WorkerToolError::UnsupportedMode(mode.to_string()));
    }
    if call.prompt.trim().is_empty() {
        return Err(WorkerToolError::EmptyPrompt);
    }

    let tool = if call.worker_type.trim().is_empty() {
        default_tool
    } else {
        call.worker_type.trim()
    };
    let model = call.model.as_deref().filter(|m| !m.is_empty());
    let (prompt_arg, stdin) = if call.use_stdin {
        ("-".to_string(), Some(call.prompt.clone()))
    } else {
        (call.prompt.clone(), None)
    };

    let mut argv: Vec<String> = match tool {
        "codex-cli" | "codex" => {
            let mut argv = strings(&[
                "codex",
                "exec",
                "--sandbox",
                "workspace-write",
                "--json",
                "--cwd",
                WORKSPACE_MOUNT,
            ]);
            if let Some(model) = model {
                argv.extend(strings(&["--model", model]));
            }
            argv.extend(call.flags.iter().cloned());
            argv.push(prompt_arg);
            argv
        }
        "claude-code" | "claude-code-cli" | "claude" => {
            let mut argv = strings(&["claude"]);
            if let Some(model) = model {
                argv.extend(strings(&["--model", model]));
            }
            argv.extend(call.flags.iter().cloned());
            argv.push("-p".to_string());
            argv.push(prompt_arg);
            argv
        }
        "gemini-cli" | "gemini" => {
            let mut argv = strings(&["gemini"]);
            if let Some(model) = model {
                argv.extend(strings(&["--model", model]));
            }
            argv.extend(strings(&["--output-format", "json"]));
            argv.extend(call.flags.iter().cloned());
            argv.push("-p".to_string());
            argv.push(prompt_arg);
            argv
        }
        "mock" => vec!["echo".to_string(), call.prompt.clone()],
        other => return Err(WorkerToolError::UnsupportedTool(other.to_string())),
    };

    if let Some(path) = call.cli_path.as_deref().filter(|p| !p.is_empty()) {
        argv[0] = path.to_string();
    }

    let stdin = if tool == "mock" { None } else { stdin };

    if !env.is_empty() {
        let mut prefixed = vec!["env".to_string()];
        prefixed.extend(env.iter().map(|(k, v)| format!("{k}={v}")));
        prefixed.append(&mut argv);
        argv = prefixed;
    }

    Ok(WorkerInvocation { argv, stdin })
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(worker_type: &str, prompt: &str) -> WorkerCall {
        WorkerCall {
            worker_type: worker_type.to_string(),
            mode: "exec".to_string(),
            prompt: prompt.to_string(),
            ..WorkerCall::default()
        }
    }

    #[test]
    fn default_tool_uses_canonical_codex_argv() {
        let invocation = build_invocation(&call("", "fix it"), "codex-cli", &BTreeMap::new()).unwrap();
        assert_eq!(
            invocation.argv,
            [
                "codex",
                "exec",
                "--sandbox",
                "workspace-write",
                "--json",
                "--cwd",
                "/workspace/project",
                "fix it"
            ]
        );
        assert_eq!(invocation.stdin, None);
    }

    #[test]
    fn codex_with_model_flags_and_stdin() {
        let mut c = call("codex-cli", "long prompt");
        c.model = Some("gpt-5.2".to_string());
        c.flags = vec!["--full-auto".to_string()];
        c.use_stdin = true;
        let invocation = build_invocation(&c, "codex-cli", &BTreeMap::new()).unwrap();
        assert_eq!(&invocation.argv[7..], ["--model", "gpt-5.2", "--full-auto", "-"]);
        assert_eq!(invocation.stdin.as_deref(), Some("long prompt"));
    }

    #[test]
    fn claude_and_gemini_argv() {
        let mut c = call("claude-code", "p");
        c.model = Some("sonnet".to_string());
        let claude = build_invocation(&c, "codex-cli", &BTreeMap::new()).unwrap();
        assert_eq!(claude.argv, ["claude", "--model", "sonnet", "-p", "p"]);

        let gemini = build_invocation(&call("gemini-cli", "p"), "codex-cli", &BTreeMap::new()).unwrap();
        assert_eq!(gemini.argv, ["gemini", "--output-format", "json", "-p", "p"]);
    }

    #[test]
    fn cli_path_and_env_prefix() {
        let mut c = call("claude-code", "p");
        c.cli_path = Some("/usr/local/bin/claude".to_string());
        let env = BTreeMap::from([
            ("B".to_string(), "2".to_string()),
            ("A".to_string(), "1".to_string()),
        ]);
        let invocation = build_invocation(&c, "codex-cli", &env).unwrap();
        assert_eq!(
            invocation.argv,
            ["env", "A=1", "B=2", "/usr/local/bin/claude", "-p", "p"]
        );
    }

    #[test]
    fn rejects_unknown_mode_tool_and_empty_prompt() {
        let mut c = call("codex-cli", "p");
        c.mode = "review".to_string();
        assert_eq!(
            build_invocation(&c, "codex-cli", &BTreeMap::new()),
            Err(WorkerToolError::UnsupportedMode("review".to_string()))
        );
        assert_eq!(
            build_invocation(&call("vim", "p"), "codex-cli", &BTreeMap::new()),
            Err(WorkerToolError::UnsupportedTool("vim".to_string()))
        );
        assert_eq!(
            build_invocation(&call("codex-cli", "  "), "codex-cli", &BTreeMap::new()),
            Err(WorkerToolError::EmptyPrompt)
        );
    }

    #[test]
    fn only_sandbox_runnable_tools_are_workers() {
        for tool in WORKER_TOOLS {
            assert!(is_worker_tool(tool), "{tool}");
            assert!(build_invocation(&call(tool, "go"), "mock", &BTreeMap::new()).is_ok());
        }
        assert!(is_worker_tool(" codex "));
        assert!(!is_worker_tool("openai-chat"));
        assert!(!is_worker_tool(""));
    }

    #[test]
    fn candidate_overrides_tool_and_fills_model() {
        let mut c = call("codex-cli", "p");
        c.env.insert("KEEP".to_string(), "call".to_string());
        let mut candidate = ToolCandidate::new("mock", Some("m"));
        candidate.flags = vec!["-x".to_string()];
        candidate.env.insert("KEEP".to_string(), "candidate".to_string());
        candidate.env.insert("NEW".to_string(), "1".to_string());
        apply_candidate(&mut c, &candidate);
        assert_eq!(c.worker_type, "mock");
        assert_eq!(c.model.as_deref(), Some("m"));
        assert_eq!(c.flags, ["-x"]);
        assert_eq!(c.env["KEEP"], "call");
        assert_eq!(c.env["NEW"], "1");
    }
}
