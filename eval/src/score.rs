//! Heuristic post-run scoring (`factory-eval score <run-dir>`).
//!
//! Criteria and weights:
//!
//! | criterion        | weight | basis                                  |
//! |------------------|--------|----------------------------------------|
//! | `build_passes`   | 0.40   | run status                             |
//! | `integrity`      | 0.25   | suppressions added, tests removed      |
//! | `diff_precision` | 0.20   | changed lines against the base         |
//! | `efficiency`     | 0.15   | iterations used                        |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use factory::core::types::{CriterionScore, RunResult, RunStatus, Score, Verdict};
use factory::io::evaluate::validate_score_value;
use factory::io::run_dir::{RunDir, read_json, write_json_atomic};

use crate::diff::{Diff, diff_against, diff_precision, integrity};

pub const SCORER: &str = "factory-eval/heuristic";

const WEIGHTS: [(&str, f64); 4] = [
    ("build_passes", 0.40),
    ("integrity", 0.25),
    ("diff_precision", 0.20),
    ("efficiency", 0.15),
];

/// Fields of `config.json` the scorer needs.
#[derive(Debug, Deserialize)]
struct RunContext {
    workdir: PathBuf,
    #[serde(default)]
    base_branch: Option<String>,
    #[serde(default = "default_remote")]
    remote: String,
}

fn default_remote() -> String {
    "origin".to_string()
}

/// Score a finished run and write `score.json` into its directory.
#[instrument(skip_all, fields(run_dir = %run_dir.display()))]
pub fn score_run_dir(run_dir: &Path, base: Option<&str>) -> Result<Score> {
    let dir = RunDir::open(run_dir);
    let result = dir.load_result()?;
    let context: RunContext = read_json(&dir.config_path())?;
    let base = match base {
        Some(base) => base.to_string(),
        None => default_base(&context),
    };

    let diff = match diff_against(&context.workdir, &base, &result.branch) {
        Ok(diff) => Some(diff),
        Err(err) => {
            warn!(err = %format!("{err:#}"), base = %base, "diff unavailable; scoring without it");
            None
        }
    };

    let score = score_result(&result, diff.as_ref());
    let value = serde_json::to_value(&score).context("serialize score")?;
    validate_score_value(&value)?;
    write_json_atomic(&dir.score_path(), &score)?;
    info!(
        verdict = score.verdict.as_str(),
        overall = score.overall_score,
        "score written"
    );
    Ok(score)
}

fn default_base(context: &RunContext) -> String {
    match &context.base_branch {
        Some(branch) => format!("{}/{branch}", context.remote),
        None => format!("{}/HEAD", context.remote),
    }
}

/// Pure scoring over the run record and (when available) its diff.
pub fn score_result(result: &RunResult, diff: Option<&Diff>) -> Score {
    let mut criteria = BTreeMap::new();

    let build = if result.status == RunStatus::Success {
        1.0
    } else {
        0.0
    };
    criteria.insert(
        "build_passes".to_string(),
        criterion(build, format!("run status {}", result.status)),
    );

    let iterations = result.iterations_used;
    criteria.insert(
        "efficiency".to_string(),
        criterion(
            efficiency(iterations),
            format!("{iterations} of {} iterations", result.max_iterations),
        ),
    );

    match diff {
        Some(diff) => {
            let lines = diff.stats.changed_lines();
            criteria.insert(
                "diff_precision".to_string(),
                criterion(
                    diff_precision(lines),
                    format!(
                        "{lines} changed lines in {} files",
                        diff.stats.files_changed
                    ),
                ),
            );
            let (score, findings) = integrity(&diff.patch);
            let reason = if findings.is_empty() {
                "no suppressions or removed tests".to_string()
            } else {
                findings.join("; ")
            };
            criteria.insert("integrity".to_string(), criterion(score, reason));
        }
        None => {
            criteria.insert(
                "diff_precision".to_string(),
                criterion(diff_precision(0), "diff unavailable".to_string()),
            );
            criteria.insert(
                "integrity".to_string(),
                criterion(1.0, "diff unavailable".to_string()),
            );
        }
    }

    let overall = weighted_overall(&criteria);
    Score {
        run_id: Some(result.run_id.clone()),
        verdict: Verdict::from_overall(overall),
        overall_score: overall,
        criteria,
        scorer: Some(SCORER.to_string()),
    }
}

/// Fewer iterations score higher; one-shot is ideal.
pub fn efficiency(iterations: u32) -> f64 {
    match iterations {
        0 | 1 => 1.0,
        2 => 0.8,
        3 | 4 => 0.5,
        _ => 0.2,
    }
}

fn weighted_overall(criteria: &BTreeMap<String, CriterionScore>) -> f64 {
    let total: f64 = WEIGHTS
        .iter()
        .map(|(name, weight)| criteria.get(*name).map_or(0.0, |c| c.score) * weight)
        .sum();
    // Keep the stored value stable under float noise.
    (total * 1000.0).round() / 1000.0
}

fn criterion(score: f64, reason: String) -> CriterionScore {
    CriterionScore { score, reason }
}
