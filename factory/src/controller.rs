//! The build-fix-verify loop: generate, check locally, submit, await CI, feed back.

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::ci_poll::CiPoller;
use crate::core::cancel::{CancelToken, is_cancelled};
use crate::core::feedback::{FeedbackEntry, FeedbackSource};
use crate::core::state::{Phase, after_failure, is_valid_transition};
use crate::core::types::{
    AgentOutcome, CheckOutcome, CiStatus, IterationRecord, RunStatus, SubmissionHandle,
};
use crate::io::agent::{Agent, ProposeRequest};
use crate::io::checks::{Verifier, VerifyRequest};
use crate::io::clock::Clock;
use crate::io::config::RunConfig;
use crate::io::hosting::Hosting;
use crate::io::prompt::{PromptEngine, PromptInputs};
use crate::io::run_dir::RunDir;
use crate::submit::{RequestText, SubmissionGateway};

/// How the controller ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub iterations: Vec<IterationRecord>,
    pub submission: Option<SubmissionHandle>,
}

/// How a single iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterationEnd {
    Succeeded,
    Retry,
    CiTimedOut,
}

pub struct Controller<'a, A: Agent, V: Verifier, H: Hosting, C: Clock> {
    config: &'a RunConfig,
    run_dir: &'a RunDir,
    agent: &'a A,
    verifier: &'a V,
    host: &'a H,
    gateway: SubmissionGateway<'a, H>,
    poller: CiPoller<'a, H, C>,
    prompts: PromptEngine,
    phase: Phase,
}

impl<'a, A: Agent, V: Verifier, H: Hosting, C: Clock> Controller<'a, A, V, H, C> {
    pub fn new(
        config: &'a RunConfig,
        run_dir: &'a RunDir,
        agent: &'a A,
        verifier: &'a V,
        host: &'a H,
        clock: &'a C,
    ) -> Result<Self> {
        let text = RequestText {
            run_id: config.run_id.clone(),
            title: config.task_title.clone(),
            task: config.task_text.clone(),
        };
        Ok(Self {
            config,
            run_dir,
            agent,
            verifier,
            host,
            gateway: SubmissionGateway::new(host, text),
            poller: CiPoller::new(host, clock, config.ci_poll_interval),
            prompts: PromptEngine::new()?,
            phase: Phase::Idle,
        })
    }

    pub fn gateway(&self) -> &SubmissionGateway<'a, H> {
        &self.gateway
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Iterate until success, CI timeout, budget exhaustion or cancellation.
    ///
    /// Collaborator failures become feedback for the next iteration. Any other
    /// error inside an iteration ends the run as failed with the error kept on
    /// the iteration record. Errors escape only when that record itself
    /// cannot be persisted.
    #[instrument(skip_all, fields(run_id = %self.config.run_id, max = self.config.max_iterations))]
    pub fn run(&mut self, cancel: &CancelToken) -> Result<RunOutcome> {
        let mut iterations = Vec::new();
        let mut feedback = Vec::new();
        let mut ordinal = 0u32;

        let status = loop {
            if self.phase == Phase::Idle {
                self.transition(Phase::Generating)?;
            }
            ordinal += 1;
            info!(iteration = ordinal, "iteration started");
            let mut record = IterationRecord::start(ordinal, std::mem::take(&mut feedback));

            let next = match self.iterate(&mut record, cancel) {
                Ok(IterationEnd::Succeeded) => Phase::Succeeded,
                Ok(IterationEnd::CiTimedOut) => Phase::TimedOutTerminal,
                Ok(IterationEnd::Retry) => {
                    feedback.clone_from(&record.feedback_out);
                    after_failure(ordinal, self.config.max_iterations)
                }
                Err(err) if is_cancelled(&err) => {
                    warn!(iteration = ordinal, "run cancelled");
                    Phase::Cancelled
                }
                Err(err) => {
                    let text = format!("{err:#}");
                    error!(iteration = ordinal, phase = ?self.phase, err = %text, "iteration aborted");
                    record.error = Some(text);
                    Phase::FailedTerminal
                }
            };

            record.finished_at = Some(Utc::now());
            self.run_dir.append_iteration(&record)?;
            iterations.push(record);
            self.transition(next)?;

            if let Some(status) = self.phase.terminal_status() {
                break status;
            }
            info!(
                iteration = ordinal,
                remaining = self.config.max_iterations - ordinal,
                "iteration failed, retrying with feedback"
            );
        };

        info!(%status, iterations = iterations.len(), "run finished");
        Ok(RunOutcome {
            status,
            iterations,
            submission: self.gateway.handle().cloned(),
        })
    }

    fn iterate(&mut self, record: &mut IterationRecord, cancel: &CancelToken) -> Result<IterationEnd> {
        let ordinal = record.ordinal;
        let config = self.config;
        let mut failures = Vec::new();

        let prompt = self.prompts.render(&PromptInputs {
            task: &config.task_text,
            iteration: ordinal,
            max_iterations: config.max_iterations,
            feedback: &record.feedback_in,
            verification: &config.verification,
        })?;
        self.run_dir.write_prompt(ordinal, &prompt)?;
        cancel.check()?;

        let agent_outcome = self.generate(ordinal, prompt, &mut failures)?;
        record.agent = Some(agent_outcome);

        self.transition(Phase::LocalChecking)?;
        cancel.check()?;
        let outcome = self.check(ordinal)?;
        record.checks = Some(outcome.clone());
        if let Some(entry) = FeedbackEntry::from_checks(ordinal, &outcome) {
            failures.push(entry);
            record.feedback_out = failures;
            return Ok(IterationEnd::Retry);
        }

        self.transition(Phase::Submitting)?;
        cancel.check()?;
        let handle = match self.gateway.submit(&config.branch, ordinal) {
            Ok(handle) => handle,
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => {
                warn!(iteration = ordinal, err = %err, "submission failed");
                let text = format!("{err:#}");
                record.submission_error = Some(text.clone());
                failures.push(FeedbackEntry::new(
                    FeedbackSource::Submission,
                    ordinal,
                    format!("Submitting the change failed:\n{text}"),
                ));
                record.feedback_out = failures;
                return Ok(IterationEnd::Retry);
            }
        };
        record.submission = Some(handle.clone());

        if !config.ci_wait_enabled() {
            debug!("CI wait disabled; local checks are final");
            return Ok(IterationEnd::Succeeded);
        }

        self.transition(Phase::CiWaiting)?;
        let report = self.poller.await_status(&handle, config.ci_timeout, cancel)?;
        self.run_dir.write_ci_snapshot(ordinal, &report)?;
        record.ci = Some(report.status.clone());
        match report.status {
            CiStatus::Passed => Ok(IterationEnd::Succeeded),
            CiStatus::Failed { checks } => {
                let entry = FeedbackEntry::from_ci_failures(ordinal, &checks);
                self.run_dir.write_ci_log(ordinal, &entry.text)?;
                failures.push(entry);
                record.feedback_out = failures;
                Ok(IterationEnd::Retry)
            }
            // The poller resolves every wait; a pending report means the budget ran out.
            CiStatus::Pending | CiStatus::TimedOut => Ok(IterationEnd::CiTimedOut),
        }
    }

    /// Run the agent. A crash is recorded as feedback; the checks still run.
    fn generate(
        &self,
        ordinal: u32,
        prompt: String,
        failures: &mut Vec<FeedbackEntry>,
    ) -> Result<AgentOutcome> {
        let config = self.config;
        let request = ProposeRequest {
            iteration: ordinal,
            workdir: config.workdir.clone(),
            prompt,
            model: config.model.clone(),
            max_cost_usd: config.max_cost_usd,
            log_path: self.run_dir.agent_log_path(ordinal),
            timeout: config.agent_timeout,
            output_limit_bytes: config.agent_output_limit_bytes,
        };
        match self.agent.propose(&request) {
            Ok(()) => {
                let changed_paths = match self.host.pending_changes() {
                    Ok(count) => Some(count),
                    Err(err) => {
                        warn!(err = %err, "could not inspect working tree after agent run");
                        None
                    }
                };
                if changed_paths == Some(0) {
                    failures.push(FeedbackEntry::new(
                        FeedbackSource::Agent,
                        ordinal,
                        "The previous attempt finished without modifying any files.",
                    ));
                }
                Ok(AgentOutcome::Completed { changed_paths })
            }
            Err(err) if is_cancelled(&err) => Err(err),
            Err(err) => {
                warn!(iteration = ordinal, err = %err, "agent invocation failed");
                let error = format!("{err:#}");
                failures.push(FeedbackEntry::new(
                    FeedbackSource::Agent,
                    ordinal,
                    format!("The code-generation agent did not complete:\n{error}"),
                ));
                Ok(AgentOutcome::Failed { error })
            }
        }
    }

    fn check(&self, ordinal: u32) -> Result<CheckOutcome> {
        let request = VerifyRequest {
            iteration: ordinal,
            workdir: self.config.workdir.clone(),
            log_path: self.run_dir.checks_log_path(ordinal),
            timeout: self.config.check_timeout,
            output_limit_bytes: self.config.check_output_limit_bytes,
        };
        match self.verifier.verify(&request) {
            Ok(outcome) => Ok(outcome),
            Err(err) if is_cancelled(&err) => Err(err),
            Err(err) => {
                warn!(iteration = ordinal, err = %err, "local verification could not run");
                Ok(CheckOutcome::Failed {
                    captured_output: format!("Local verification could not run:\n{err:#}"),
                    failed_checks: Vec::new(),
                })
            }
        }
    }

    fn transition(&mut self, next: Phase) -> Result<()> {
        if !is_valid_transition(self.phase, next) {
            bail!("invalid phase transition {:?} -> {:?}", self.phase, next);
        }
        debug!(from = ?self.phase, to = ?next, "phase");
        self.phase = next;
        Ok(())
    }
}
