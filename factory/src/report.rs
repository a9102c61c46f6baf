//! Terminal bookkeeping: result record, request description, evaluation, notification.

use anyhow::Result;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::controller::RunOutcome;
use crate::core::types::{RunResult, RunStatus};
use crate::io::config::RunConfig;
use crate::io::evaluate::Evaluator;
use crate::io::hosting::Hosting;
use crate::io::notify::Notifier;
use crate::io::run_dir::RunDir;
use crate::submit::SubmissionGateway;

pub struct Reporter<'a> {
    evaluator: Option<&'a dyn Evaluator>,
    notifier: &'a dyn Notifier,
}

impl<'a> Reporter<'a> {
    pub fn new(evaluator: Option<&'a dyn Evaluator>, notifier: &'a dyn Notifier) -> Self {
        Self {
            evaluator,
            notifier,
        }
    }

    /// Persist `result.json` and run the best-effort follow-ups.
    ///
    /// Only a failure to write the result record is an error; the description
    /// update, evaluation and notification are logged and skipped on failure.
    #[instrument(skip_all, fields(status = %outcome.status))]
    pub fn finish<H: Hosting>(
        &self,
        config: &RunConfig,
        run_dir: &RunDir,
        gateway: &SubmissionGateway<'_, H>,
        outcome: &RunOutcome,
    ) -> Result<RunResult> {
        let iterations_used = u32::try_from(outcome.iterations.len()).unwrap_or(u32::MAX);

        if matches!(outcome.status, RunStatus::Success | RunStatus::Failed)
            && let Err(err) =
                gateway.update_description(outcome.status, iterations_used, config.max_iterations)
        {
            warn!(err = %err, "could not update change request description");
        }

        let mut result = RunResult {
            run_id: config.run_id.clone(),
            status: outcome.status,
            iterations_used,
            max_iterations: config.max_iterations,
            branch: config.branch.clone(),
            request: outcome.submission.clone(),
            model: config.model.clone(),
            score: None,
            task_title: config.task_title.clone(),
            started_at: config.started_at,
            finished_at: Utc::now(),
            run_dir: run_dir.path().to_path_buf(),
        };
        run_dir.write_result(&result)?;

        if outcome.status == RunStatus::Success
            && let Some(evaluator) = self.evaluator
        {
            match evaluator.score(run_dir.path()) {
                Ok(score) => {
                    info!(verdict = score.verdict.as_str(), overall = score.overall_score, "run scored");
                    result.score = Some(score);
                    run_dir.write_result(&result)?;
                }
                Err(err) => warn!(err = %format!("{err:#}"), "evaluation failed; result kept unscored"),
            }
        }

        if let Err(err) = self.notifier.send(&summary_message(&result)) {
            warn!(err = %err, "notification failed");
        }
        Ok(result)
    }
}

/// Human-readable summary sent to the notification channel.
pub fn summary_message(result: &RunResult) -> String {
    let headline = match result.status {
        RunStatus::Success => format!(
            "factory run {} succeeded after {} of {} iterations",
            result.run_id, result.iterations_used, result.max_iterations
        ),
        RunStatus::Failed => format!(
            "factory run {} failed: no passing change after {} iterations",
            result.run_id, result.iterations_used
        ),
        RunStatus::CiTimeout => format!(
            "factory run {} stopped: CI did not finish in time (iteration {})",
            result.run_id, result.iterations_used
        ),
        RunStatus::Cancelled => format!(
            "factory run {} was cancelled during iteration {}",
            result.run_id, result.iterations_used
        ),
    };
    let mut lines = vec![headline, format!("Task: {}", result.task_title)];
    match &result.request {
        Some(request) => lines.push(format!("Change request: {}", request.url)),
        None => lines.push(format!("Branch: {}", result.branch)),
    }
    if let Some(score) = &result.score {
        lines.push(format!(
            "Score: {} ({:.2})",
            score.verdict.as_str(),
            score.overall_score
        ));
    }
    lines.push(format!("Artifacts: {}", result.run_dir.display()));
    lines.join("\n")
}
