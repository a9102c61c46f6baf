//! Post-run evaluation: an external scorer writes `score.json` into the run dir.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::core::cancel::CancelToken;
use crate::core::types::Score;
use crate::io::process::run_command_with_timeout;

const SCORE_SCHEMA: &str = include_str!("../../schemas/score.schema.json");

pub trait Evaluator {
    /// Score the run whose artifacts live in `run_dir`.
    fn score(&self, run_dir: &Path) -> Result<Score>;
}

/// Runs a scoring command with the run dir as its last argument.
pub struct CommandEvaluator {
    command: Vec<String>,
    timeout: Duration,
    cancel: CancelToken,
}

impl CommandEvaluator {
    pub fn new(command: Vec<String>, timeout: Duration, cancel: CancelToken) -> Self {
        Self {
            command,
            timeout,
            cancel,
        }
    }
}

impl Evaluator for CommandEvaluator {
    #[instrument(skip_all, fields(run_dir = %run_dir.display()))]
    fn score(&self, run_dir: &Path) -> Result<Score> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("evaluator command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(leading).arg(run_dir);
        info!(command = ?self.command, "running evaluator");
        let output = run_command_with_timeout(cmd, None, self.timeout, 100_000, &self.cancel)
            .context("run evaluator")?;
        if !output.success() {
            bail!(
                "evaluator failed with status {:?}: {}",
                output.status.code(),
                output.stderr_lossy().trim()
            );
        }
        load_score(&run_dir.join("score.json"))
    }
}

/// Read `score.json`, validating it against the score schema first.
pub fn load_score(path: &Path) -> Result<Score> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let instance: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    validate_score_value(&instance)?;
    let score: Score = serde_json::from_value(instance).context("decode score")?;
    debug!(verdict = score.verdict.as_str(), overall = score.overall_score, "score loaded");
    Ok(score)
}

/// Validate a score document against the bundled JSON Schema (Draft 2020-12).
pub fn validate_score_value(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(SCORE_SCHEMA).context("parse score schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile score schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("score validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
