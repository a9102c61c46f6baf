//! One complete run: prepare the artifact directory, iterate, report.

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::controller::{Controller, RunOutcome};
use crate::core::cancel::CancelToken;
use crate::core::types::{RunResult, RunStatus};
use crate::io::agent::Agent;
use crate::io::checks::Verifier;
use crate::io::clock::Clock;
use crate::io::config::RunConfig;
use crate::io::evaluate::Evaluator;
use crate::io::hosting::Hosting;
use crate::io::notify::Notifier;
use crate::io::run_dir::RunDir;
use crate::report::Reporter;

/// Everything a run talks to.
pub struct Collaborators<'a, A, V, H, C> {
    pub agent: &'a A,
    pub verifier: &'a V,
    pub host: &'a H,
    pub clock: &'a C,
    pub evaluator: Option<&'a dyn Evaluator>,
    pub notifier: &'a dyn Notifier,
}

/// Execute a run to a terminal status and return its persisted result.
///
/// Cancellation is a terminal status, not an error.
pub fn execute<A: Agent, V: Verifier, H: Hosting, C: Clock>(
    config: &RunConfig,
    parts: &Collaborators<'_, A, V, H, C>,
    cancel: &CancelToken,
) -> Result<RunResult> {
    let run_dir = RunDir::create(&config.run_dir)?;
    run_dir
        .write_task(&config.task_text)
        .context("write task description")?;
    run_dir.write_config(config).context("write run config")?;
    info!(
        run_id = %config.run_id,
        branch = %config.branch,
        run_dir = %run_dir.path().display(),
        "run started"
    );

    let mut controller = Controller::new(
        config,
        &run_dir,
        parts.agent,
        parts.verifier,
        parts.host,
        parts.clock,
    )?;
    let reporter = Reporter::new(parts.evaluator, parts.notifier);
    let outcome = match controller.run(cancel) {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(err = %format!("{err:#}"), "run aborted");
            let outcome = RunOutcome {
                status: RunStatus::Failed,
                iterations: run_dir.load_iterations().unwrap_or_default(),
                submission: controller.gateway().handle().cloned(),
            };
            if let Err(report_err) =
                reporter.finish(config, &run_dir, controller.gateway(), &outcome)
            {
                warn!(err = %format!("{report_err:#}"), "failed result not recorded");
            }
            return Err(err);
        }
    };
    reporter.finish(config, &run_dir, controller.gateway(), &outcome)
}
