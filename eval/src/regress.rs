//! Replay earlier tasks through `factory run` and compare outcomes
//! (`factory-eval regress <runs-dir>`).
//!
//! Each distinct `task.md` under the runs directory is replayed once, starting
//! from its most recent run. The new run is found by diffing the runs directory
//! before and after the replay.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use factory::core::cancel::CancelToken;
use factory::core::types::{RunResult, RunStatus};
use factory::io::process::run_command_with_timeout;
use factory::io::run_dir::{RunDir, read_json};

use crate::report::{file_sha256, load_run_dirs, load_score};

const OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub iterations: u32,
    pub overall_score: Option<f64>,
}

/// A task to replay, with the latest run that attempted it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayTask {
    pub task_hash: String,
    pub title: String,
    pub task_path: PathBuf,
    pub workdir: PathBuf,
    /// Directory the replayed run is expected to land in.
    pub runs_root: PathBuf,
    pub previous: RunSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Improved,
    Regressed,
    Unchanged,
    Error,
}

impl Change {
    pub fn as_str(self) -> &'static str {
        match self {
            Change::Improved => "improved",
            Change::Regressed => "regressed",
            Change::Unchanged => "unchanged",
            Change::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub task_hash: String,
    pub title: String,
    pub previous: RunSnapshot,
    pub replay: Option<RunSnapshot>,
    pub error: Option<String>,
    pub change: Change,
}

/// Starts a fresh factory run for a task.
pub trait Replayer {
    fn replay(&self, task: &ReplayTask, branch: &str) -> Result<()>;
}

/// Replays by invoking the `factory` binary.
pub struct FactoryCommand {
    pub program: PathBuf,
    pub timeout: Duration,
}

impl Replayer for FactoryCommand {
    #[instrument(skip_all, fields(task = %task.title, branch))]
    fn replay(&self, task: &ReplayTask, branch: &str) -> Result<()> {
        let task_path = std::path::absolute(&task.task_path)
            .with_context(|| format!("resolve {}", task.task_path.display()))?;
        let mut cmd = Command::new(&self.program);
        cmd.arg("run")
            .arg(&task_path)
            .arg("--workdir")
            .arg(&task.workdir)
            .arg("--branch")
            .arg(branch)
            .current_dir(&task.workdir);
        let output = run_command_with_timeout(
            cmd,
            None,
            self.timeout,
            OUTPUT_LIMIT_BYTES,
            &CancelToken::new(),
        )
        .with_context(|| format!("spawn {}", self.program.display()))?;
        if output.timed_out {
            bail!("factory run timed out after {}s", self.timeout.as_secs());
        }
        if !output.success() {
            // A run that errors out may still have recorded a result.
            warn!(
                status = ?output.status,
                stderr = %output.stderr_lossy().trim_end(),
                "factory run exited unsuccessfully"
            );
        }
        Ok(())
    }
}

/// Fields of `config.json` a replay needs.
#[derive(Debug, Deserialize)]
struct ReplayContext {
    workdir: PathBuf,
}

/// Latest run per distinct task, oldest first, capped at `limit`.
///
/// Runs without a readable result, task or config are skipped with a warning.
pub fn plan(runs_dir: &Path, limit: Option<usize>) -> Result<(Vec<ReplayTask>, Vec<String>)> {
    let mut warnings = Vec::new();
    let mut latest: BTreeMap<String, ReplayTask> = BTreeMap::new();

    for path in load_run_dirs(runs_dir)? {
        let dir = RunDir::open(&path);
        let loaded = dir.load_result().and_then(|result| {
            let hash = file_sha256(&dir.task_path())?;
            let context: ReplayContext = read_json(&dir.config_path())?;
            Ok((result, hash, context))
        });
        let (result, task_hash, context) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                warnings.push(format!("skip {}: {err:#}", path.display()));
                continue;
            }
        };
        let previous = snapshot(&dir, &result, &mut warnings);
        latest.insert(
            task_hash.clone(),
            ReplayTask {
                task_hash,
                title: result.task_title,
                task_path: dir.task_path(),
                workdir: context.workdir,
                runs_root: runs_dir.to_path_buf(),
                previous,
            },
        );
    }

    let mut tasks: Vec<ReplayTask> = latest.into_values().collect();
    tasks.sort_by(|a, b| a.previous.run_id.cmp(&b.previous.run_id));
    if let Some(limit) = limit {
        tasks.truncate(limit);
    }
    Ok((tasks, warnings))
}

/// Replay every task in order and compare each new run with its predecessor.
///
/// A failed replay is recorded on its comparison; the remaining tasks still run.
pub fn regress(tasks: &[ReplayTask], replayer: &dyn Replayer, stamp: &str) -> Vec<Comparison> {
    tasks
        .iter()
        .map(|task| {
            info!(task = %task.title, previous = %task.previous.run_id, "replaying task");
            let replay = replay_one(task, replayer, stamp);
            let (replay, error) = match replay {
                Ok(snapshot) => (Some(snapshot), None),
                Err(err) => {
                    warn!(task = %task.title, err = %format!("{err:#}"), "replay failed");
                    (None, Some(format!("{err:#}")))
                }
            };
            let change = compare(&task.previous, replay.as_ref());
            Comparison {
                task_hash: task.task_hash.clone(),
                title: task.title.clone(),
                previous: task.previous.clone(),
                replay,
                error,
                change,
            }
        })
        .collect()
}

fn replay_one(task: &ReplayTask, replayer: &dyn Replayer, stamp: &str) -> Result<RunSnapshot> {
    let before: BTreeSet<PathBuf> = load_run_dirs(&task.runs_root)?.into_iter().collect();
    let branch = format!(
        "agent/regression-{}-{stamp}",
        &task.task_hash[..8.min(task.task_hash.len())]
    );
    replayer.replay(task, &branch)?;
    let created = load_run_dirs(&task.runs_root)?
        .into_iter()
        .rev()
        .find(|path| !before.contains(path))
        .with_context(|| format!("no new run under {}", task.runs_root.display()))?;
    let dir = RunDir::open(&created);
    let result = dir.load_result()?;
    let mut warnings = Vec::new();
    let replay = snapshot(&dir, &result, &mut warnings);
    for warning in warnings {
        warn!("{warning}");
    }
    Ok(replay)
}

fn snapshot(dir: &RunDir, result: &RunResult, warnings: &mut Vec<String>) -> RunSnapshot {
    RunSnapshot {
        run_id: result.run_id.clone(),
        status: result.status,
        iterations: result.iterations_used,
        overall_score: load_score(dir, result, warnings).map(|score| score.overall_score),
    }
}

/// Success beats any other status; between equal outcomes fewer iterations win.
pub fn compare(previous: &RunSnapshot, replay: Option<&RunSnapshot>) -> Change {
    let Some(replay) = replay else {
        return Change::Error;
    };
    let was_success = previous.status == RunStatus::Success;
    let is_success = replay.status == RunStatus::Success;
    match (was_success, is_success) {
        (false, true) => Change::Improved,
        (true, false) => Change::Regressed,
        (true, true) if replay.iterations < previous.iterations => Change::Improved,
        (true, true) if replay.iterations > previous.iterations => Change::Regressed,
        _ => Change::Unchanged,
    }
}

pub fn any_regressed(comparisons: &[Comparison]) -> bool {
    comparisons
        .iter()
        .any(|c| matches!(c.change, Change::Regressed | Change::Error))
}

pub fn render_plan(tasks: &[ReplayTask]) -> String {
    let mut out = format!("{} task(s) to replay\n", tasks.len());
    for task in tasks {
        let _ = writeln!(
            out,
            "  {} (status={}, iters={}, run={})",
            task.title,
            task.previous.status,
            task.previous.iterations,
            task.previous.run_id
        );
    }
    out
}

pub fn render_text(comparisons: &[Comparison]) -> String {
    let mut out = String::new();
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for comparison in comparisons {
        *counts.entry(comparison.change.as_str()).or_insert(0) += 1;
        let new = match (&comparison.replay, &comparison.error) {
            (Some(replay), _) => describe(replay),
            (None, Some(error)) => format!("error: {error}"),
            (None, None) => "error".to_string(),
        };
        let _ = writeln!(
            out,
            "{:<10} {}: {} -> {}",
            comparison.change.as_str(),
            comparison.title,
            describe(&comparison.previous),
            new
        );
    }
    let totals: Vec<String> = counts
        .iter()
        .map(|(change, count)| format!("{change}: {count}"))
        .collect();
    let _ = writeln!(out, "replayed {} [{}]", comparisons.len(), totals.join(", "));
    out
}

fn describe(run: &RunSnapshot) -> String {
    let score = run
        .overall_score
        .map_or_else(|| "-".to_string(), |score| format!("{score:.2}"));
    format!("{} in {} iter, score {score}", run.status, run.iterations)
}
