//! Aggregate report over many run directories (`factory-eval report <runs-dir>`).

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

use factory::core::types::{RunResult, RunStatus, Score};
use factory::io::run_dir::{RunDir, read_json};

#[derive(Debug, Default, Serialize)]
pub struct ReportSummary {
    pub runs: usize,
    pub success: usize,
    pub failed: usize,
    pub ci_timeout: usize,
    pub cancelled: usize,
    pub avg_iterations: Option<f64>,
    pub avg_duration_secs: Option<f64>,
    pub scored: usize,
    pub avg_overall_score: Option<f64>,
    /// Criterion name -> (sum of scores, count).
    pub criteria: BTreeMap<String, (f64, usize)>,
    pub verdicts: BTreeMap<String, usize>,
    /// Tasks attempted more than once, keyed by SHA-256 of `task.md`.
    pub repeated_tasks: Vec<TaskGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskGroup {
    pub task_hash: String,
    pub title: String,
    pub run_ids: Vec<String>,
    pub statuses: Vec<RunStatus>,
}

pub fn load_run_dirs(runs_dir: &Path) -> Result<Vec<PathBuf>> {
    if !runs_dir.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(runs_dir).with_context(|| format!("read {}", runs_dir.display()))? {
        let entry = entry.context("read entry")?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Summarise every run directory under `runs_dir`.
///
/// Directories without a readable `result.json` are skipped with a warning;
/// an unreadable `score.json` only drops that run from the score averages.
pub fn aggregate(runs_dir: &Path) -> Result<(ReportSummary, Vec<String>)> {
    let mut summary = ReportSummary::default();
    let mut warnings = Vec::new();
    let mut iterations_total = 0u64;
    let mut duration_total = 0.0;
    let mut overall_total = 0.0;
    let mut groups: BTreeMap<String, TaskGroup> = BTreeMap::new();

    for path in load_run_dirs(runs_dir)? {
        let dir = RunDir::open(&path);
        let result: RunResult = match dir.load_result() {
            Ok(result) => result,
            Err(err) => {
                warnings.push(format!(
                    "skip {}: result.json invalid ({err:#})",
                    path.display()
                ));
                continue;
            }
        };

        summary.runs += 1;
        match result.status {
            RunStatus::Success => summary.success += 1,
            RunStatus::Failed => summary.failed += 1,
            RunStatus::CiTimeout => summary.ci_timeout += 1,
            RunStatus::Cancelled => summary.cancelled += 1,
        }
        iterations_total += u64::from(result.iterations_used);
        duration_total += (result.finished_at - result.started_at).num_milliseconds() as f64 / 1000.0;

        if let Some(score) = load_score(&dir, &result, &mut warnings) {
            summary.scored += 1;
            overall_total += score.overall_score;
            *summary
                .verdicts
                .entry(score.verdict.as_str().to_string())
                .or_insert(0) += 1;
            for (name, criterion) in &score.criteria {
                let entry = summary.criteria.entry(name.clone()).or_insert((0.0, 0));
                entry.0 += criterion.score;
                entry.1 += 1;
            }
        }

        match file_sha256(&dir.task_path()) {
            Ok(hash) => {
                let group = groups.entry(hash.clone()).or_insert_with(|| TaskGroup {
                    task_hash: hash,
                    title: result.task_title.clone(),
                    run_ids: Vec::new(),
                    statuses: Vec::new(),
                });
                group.run_ids.push(result.run_id.clone());
                group.statuses.push(result.status);
            }
            Err(err) => warnings.push(format!("{}: task hash unavailable ({err:#})", path.display())),
        }
    }

    if summary.runs > 0 {
        let runs = summary.runs as f64;
        summary.avg_iterations = Some(iterations_total as f64 / runs);
        summary.avg_duration_secs = Some(duration_total / runs);
    }
    if summary.scored > 0 {
        summary.avg_overall_score = Some(overall_total / summary.scored as f64);
    }
    summary.repeated_tasks = groups
        .into_values()
        .filter(|group| group.run_ids.len() > 1)
        .collect();
    Ok((summary, warnings))
}

/// Prefer `score.json`; fall back to the score embedded in `result.json`.
pub(crate) fn load_score(dir: &RunDir, result: &RunResult, warnings: &mut Vec<String>) -> Option<Score> {
    let path = dir.score_path();
    if path.exists() {
        match read_json::<Score>(&path) {
            Ok(score) => return Some(score),
            Err(err) => warnings.push(format!("{}: score.json invalid ({err:#})", dir.path().display())),
        }
    }
    result.score.clone()
}

pub(crate) fn file_sha256(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(contents);
    Ok(hex::encode(hasher.finalize()))
}

pub fn render_text(summary: &ReportSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "runs: {}", summary.runs);
    let _ = writeln!(
        out,
        "success: {}  failed: {}  ci_timeout: {}  cancelled: {}",
        summary.success, summary.failed, summary.ci_timeout, summary.cancelled
    );
    if let Some(avg) = summary.avg_iterations {
        let _ = writeln!(out, "avg iterations: {avg:.2}");
    }
    if let Some(avg) = summary.avg_duration_secs {
        let _ = writeln!(out, "avg duration: {avg:.1}s");
    }
    if let Some(avg) = summary.avg_overall_score {
        let _ = writeln!(out, "avg overall score: {avg:.3} ({} scored)", summary.scored);
    }
    for (verdict, count) in &summary.verdicts {
        let _ = writeln!(out, "verdict {verdict}: {count}");
    }
    for (name, (sum, count)) in &summary.criteria {
        let _ = writeln!(out, "criterion {name}: {:.3}", sum / *count as f64);
    }
    for group in &summary.repeated_tasks {
        let statuses: Vec<&str> = group.statuses.iter().map(|s| s.as_str()).collect();
        let _ = writeln!(
            out,
            "repeated task {} ({}): {} runs [{}]",
            &group.task_hash[..12.min(group.task_hash.len())],
            group.title,
            group.run_ids.len(),
            statuses.join(", ")
        );
    }
    out
}
