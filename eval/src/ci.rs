//! Pull-request evaluation inside CI (`factory-eval ci`).
//!
//! Detects the project type, runs its check commands with bounded output,
//! measures the diff against the base and renders a markdown summary.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use factory::core::cancel::CancelToken;
use factory::core::checks::ProjectMarkers;
use factory::io::checks::detect_markers;
use factory::io::process::run_command_with_timeout;

use crate::diff::{DiffStats, diff_against, diff_precision};

const TAIL_LINES: usize = 20;

/// Limits for command execution in checks.
#[derive(Debug, Clone, Copy)]
pub struct CommandLimits {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl CommandLimits {
    /// 30 minute timeout, 200KB output.
    pub fn default_limits() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            output_limit_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiCheck {
    pub name: &'static str,
    pub command: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CiCheckOutcome {
    pub name: String,
    pub passed: bool,
    pub timed_out: bool,
    pub tail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CiEvaluation {
    pub checks: Vec<CiCheckOutcome>,
    pub diff: Option<DiffStats>,
    pub diff_precision: f64,
}

impl CiEvaluation {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|check| check.passed)
    }
}

/// Commands for the detected project; empty when nothing is recognised.
pub fn checks_for(markers: ProjectMarkers) -> Vec<CiCheck> {
    if markers.flutter {
        vec![
            CiCheck {
                name: "analyze",
                command: "flutter analyze --no-pub",
            },
            CiCheck {
                name: "test",
                command: "flutter test",
            },
        ]
    } else if markers.node {
        vec![
            CiCheck {
                name: "lint",
                command: "npm run lint",
            },
            CiCheck {
                name: "test",
                command: "npm test",
            },
            CiCheck {
                name: "build",
                command: "npm run build",
            },
        ]
    } else if markers.cargo {
        vec![
            CiCheck {
                name: "clippy",
                command: "cargo clippy --all-targets -- -D warnings",
            },
            CiCheck {
                name: "test",
                command: "cargo test",
            },
        ]
    } else {
        Vec::new()
    }
}

/// Run the project's checks and diff metrics in `workdir`.
#[instrument(skip_all, fields(workdir = %workdir.display(), base))]
pub fn evaluate(workdir: &Path, base: &str, limits: CommandLimits) -> Result<CiEvaluation> {
    let checks = checks_for(detect_markers(workdir));
    if checks.is_empty() {
        warn!("no recognised project; only the diff is measured");
    }
    let mut outcomes = Vec::with_capacity(checks.len());
    for check in &checks {
        outcomes.push(run_check(check, workdir, limits)?);
    }

    let diff = match diff_against(workdir, base, "HEAD") {
        Ok(diff) => Some(diff.stats),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "diff unavailable");
            None
        }
    };
    let lines = diff.map_or(0, |stats| stats.changed_lines());
    Ok(CiEvaluation {
        checks: outcomes,
        diff,
        diff_precision: diff_precision(lines),
    })
}

fn run_check(check: &CiCheck, workdir: &Path, limits: CommandLimits) -> Result<CiCheckOutcome> {
    info!(check = check.name, "running check");
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(check.command).current_dir(workdir);
    let output = run_command_with_timeout(
        cmd,
        None,
        limits.timeout,
        limits.output_limit_bytes,
        &CancelToken::new(),
    )
    .with_context(|| format!("spawn check {}", check.name))?;
    let passed = output.success();
    if output.timed_out {
        warn!(check = check.name, "check timed out");
    } else {
        debug!(check = check.name, passed, "check result");
    }
    let mut text = output.stdout_lossy();
    text.push_str(&output.stderr_lossy());
    Ok(CiCheckOutcome {
        name: check.name.to_string(),
        passed,
        timed_out: output.timed_out,
        tail: tail(&text, TAIL_LINES),
    })
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Markdown summary in the shape GitHub renders for step summaries.
pub fn render_summary(eval: &CiEvaluation, label: &str) -> String {
    let mut out = format!("## Factory eval: {label}\n\n| Metric | Score |\n|--------|-------|\n");
    for check in &eval.checks {
        let score = if check.passed { 1.0 } else { 0.0 };
        out.push_str(&format!("| {} | {score:.1} |\n", check.name));
    }
    out.push_str(&format!("| diff_precision | {:.1} |\n", eval.diff_precision));
    match eval.diff {
        Some(stats) => out.push_str(&format!(
            "\n**Diff:** {} files, +{}/-{} ({} total)\n",
            stats.files_changed,
            stats.insertions,
            stats.deletions,
            stats.changed_lines()
        )),
        None => out.push_str("\n**Diff:** unavailable\n"),
    }
    for check in &eval.checks {
        let mark = if check.passed { "passed" } else { "failed" };
        out.push_str(&format!(
            "\n### {}: {mark}\n```\n{}\n```\n",
            check.name, check.tail
        ));
    }
    out
}

/// Append to the summary file (GitHub accumulates step summaries).
pub fn append_summary(path: &Path, markdown: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(markdown.as_bytes())
        .with_context(|| format!("write {}", path.display()))
}
