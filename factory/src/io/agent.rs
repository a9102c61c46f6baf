//! Code-generation agent abstraction.
//!
//! The [`Agent`] trait decouples the controller from the agent backend
//! (currently the `claude` CLI). Tests use scripted agents that edit the
//! working tree directly without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::io::process::{CommandOutput, run_command_with_stream};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct ProposeRequest {
    pub iteration: u32,
    /// Working directory the agent edits.
    pub workdir: PathBuf,
    pub prompt: String,
    pub model: String,
    /// Spend ceiling for this invocation.
    pub max_cost_usd: f64,
    /// stdout is streamed here while the agent runs; stderr is appended at the end.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait Agent {
    /// Let the agent propose a change by editing the working tree.
    fn propose(&self, request: &ProposeRequest) -> Result<()>;
}

/// Agent backed by the `claude` CLI in non-interactive print mode.
pub struct ClaudeAgent {
    /// Program and leading arguments.
    command: Vec<String>,
    cancel: CancelToken,
}

impl ClaudeAgent {
    pub fn new(command: Vec<String>, cancel: CancelToken) -> Self {
        Self { command, cancel }
    }

    fn build_command(&self, request: &ProposeRequest) -> Result<Command> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .arg("--print")
            .arg("--dangerously-skip-permissions")
            .arg("--model")
            .arg(&request.model)
            .arg("--max-budget-usd")
            .arg(format!("{:.2}", request.max_cost_usd))
            .current_dir(&request.workdir);
        Ok(cmd)
    }
}

impl Agent for ClaudeAgent {
    #[instrument(skip_all, fields(iteration = request.iteration, model = %request.model))]
    fn propose(&self, request: &ProposeRequest) -> Result<()> {
        info!(workdir = %request.workdir.display(), "invoking generation agent");
        let cmd = self.build_command(request)?;
        let output = run_command_with_stream(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            Some(&request.log_path),
            &self.cancel,
        )
        .context("run generation agent")?;

        append_stderr(&request.log_path, &output)?;

        if output.timed_out {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "agent timed out"
            );
            bail!("agent timed out after {:?}", request.timeout);
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            let stderr = output.stderr_lossy();
            bail!(
                "agent exited with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            );
        }
        debug!("agent completed");
        Ok(())
    }
}

fn append_stderr(path: &Path, output: &CommandOutput) -> Result<()> {
    let mut log = fs::read_to_string(path).unwrap_or_default();
    if output.stdout_truncated > 0 {
        log.push_str(&format!(
            "\n[agent stdout truncated {} bytes in memory]\n",
            output.stdout_truncated
        ));
    }
    log.push_str("\n=== stderr ===\n");
    log.push_str(&output.stderr_lossy());
    if output.timed_out {
        log.push_str("\n[agent timed out]\n");
    }
    fs::write(path, log).with_context(|| format!("write agent log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &Path) -> ProposeRequest {
        ProposeRequest {
            iteration: 1,
            workdir: dir.to_path_buf(),
            prompt: "fix it".to_string(),
            model: "sonnet".to_string(),
            max_cost_usd: 2.5,
            log_path: dir.join("agent-iter-1.log"),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        }
    }

    #[test]
    fn passes_model_budget_and_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        // Stand-in CLI: echo the arguments, then the prompt from stdin.
        let agent = ClaudeAgent::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo \"$@\"; cat".to_string(),
                "agent".to_string(),
            ],
            CancelToken::new(),
        );
        agent.propose(&request(temp.path())).expect("propose");
        let log = fs::read_to_string(temp.path().join("agent-iter-1.log")).expect("log");
        assert!(log.contains("--model sonnet"));
        assert!(log.contains("--max-budget-usd 2.50"));
        assert!(log.contains("fix it"));
        assert!(log.contains("=== stderr ==="));
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = ClaudeAgent::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo quota exceeded >&2; exit 3".to_string(),
            ],
            CancelToken::new(),
        );
        let err = agent.propose(&request(temp.path())).unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn empty_command_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = ClaudeAgent::new(Vec::new(), CancelToken::new());
        assert!(agent.propose(&request(temp.path())).is_err());
    }
}
