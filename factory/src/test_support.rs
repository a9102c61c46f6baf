//! Scripted collaborators for exercising the controller without processes or network.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::{TimeZone, Utc};

use crate::core::cancel::{CancelToken, Cancelled};
use crate::core::types::{
    CheckOutcome, CheckSnapshot, CheckState, CreateRequest, CriterionScore, RemoteCheck,
    RequestRef, Score, Verdict,
};
use crate::io::agent::{Agent, ProposeRequest};
use crate::io::checks::{Verifier, VerifyRequest};
use crate::io::clock::Clock;
use crate::io::config::{RunConfig, Verification};
use crate::io::evaluate::Evaluator;
use crate::io::hosting::Hosting;
use crate::io::notify::Notifier;

/// Configuration for scripted runs: three iterations, ten-minute CI wait, 30s polls.
pub fn run_config(workdir: &Path) -> RunConfig {
    RunConfig {
        run_id: "20260101-000000-test-task".to_string(),
        task_title: "Test task".to_string(),
        task_text: "# Test task\n\nMake the widget blue.".to_string(),
        branch: "agent/20260101-000000-test-task".to_string(),
        base_branch: None,
        remote: "origin".to_string(),
        model: "sonnet".to_string(),
        max_iterations: 3,
        max_cost_usd: 1.0,
        ci_timeout: Duration::from_secs(10 * 60),
        skip_ci: false,
        ci_poll_interval: Duration::from_secs(30),
        verification: Verification::Checks(vec!["noop".to_string()]),
        check_timeout: Duration::from_secs(60),
        check_output_limit_bytes: 10_000,
        notify: None,
        workdir: workdir.to_path_buf(),
        run_dir: workdir.join(".factory/runs/20260101-000000-test-task"),
        agent_command: vec!["claude".to_string()],
        agent_timeout: Duration::from_secs(60),
        agent_output_limit_bytes: 10_000,
        evaluator_command: None,
        evaluator_timeout: Duration::from_secs(60),
        started_at: Utc
            .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now),
    }
}

pub fn remote_check(name: &str, state: CheckState) -> RemoteCheck {
    RemoteCheck {
        name: name.to_string(),
        state,
        link: None,
    }
}

pub fn failed_checks(output: &str) -> CheckOutcome {
    CheckOutcome::Failed {
        captured_output: output.to_string(),
        failed_checks: vec!["unitTest".to_string()],
    }
}

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub enum AgentStep {
    Succeed,
    Fail(String),
    /// Trip the token, as a Ctrl-C during the agent run would.
    Cancel(CancelToken),
}

/// Agent that replays scripted steps and records every prompt it receives.
#[derive(Default)]
pub struct ScriptedAgent {
    steps: RefCell<VecDeque<AgentStep>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<AgentStep>) -> Self {
        Self {
            steps: RefCell::new(steps.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.borrow().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl Agent for ScriptedAgent {
    fn propose(&self, request: &ProposeRequest) -> Result<()> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        match self.steps.borrow_mut().pop_front() {
            None | Some(AgentStep::Succeed) => Ok(()),
            Some(AgentStep::Fail(msg)) => Err(anyhow!(msg)),
            Some(AgentStep::Cancel(token)) => {
                token.cancel();
                Err(Cancelled.into())
            }
        }
    }
}

/// Verifier that replays outcomes; passes once the script runs out.
#[derive(Default)]
pub struct ScriptedVerifier {
    outcomes: RefCell<VecDeque<CheckOutcome>>,
    calls: Cell<usize>,
}

impl ScriptedVerifier {
    pub fn new(outcomes: Vec<CheckOutcome>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into()),
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self, _request: &VerifyRequest) -> Result<CheckOutcome> {
        self.calls.set(self.calls.get() + 1);
        Ok(self
            .outcomes
            .borrow_mut()
            .pop_front()
            .unwrap_or(CheckOutcome::Passed))
    }
}

#[derive(Default)]
struct HostState {
    existing: Option<RequestRef>,
    next_number: u64,
    create_calls: usize,
    push_calls: usize,
    record_calls: usize,
    check_calls: usize,
    push_failures: VecDeque<String>,
    create_failures: VecDeque<String>,
    checks: VecDeque<std::result::Result<Vec<RemoteCheck>, String>>,
    default_checks: Vec<RemoteCheck>,
    run_logs: BTreeMap<u64, String>,
    bodies: Vec<String>,
    pending_changes: usize,
    /// Local commit counter; every recorded change is a new commit.
    head: u64,
    /// Commit the open request reports as its head.
    request_head: u64,
    /// Polls for which the request keeps its old head after each push.
    lag_polls: usize,
    head_lag: usize,
    last_checks: Vec<RemoteCheck>,
}

fn commit_id(n: u64) -> String {
    format!("commit-{n}")
}

/// In-memory hosting service.
///
/// Created requests are remembered, so a second create reports `AlreadyExists`.
/// Check snapshots replay from a script, then repeat the default (no checks).
/// Each recorded change is a new commit; a push moves the request head to it,
/// unless [`FakeHosting::lag_request_head`] holds it back for a few polls.
pub struct FakeHosting {
    state: RefCell<HostState>,
}

impl Default for FakeHosting {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHosting {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(HostState {
                next_number: 100,
                pending_changes: 1,
                ..HostState::default()
            }),
        }
    }

    pub fn set_existing_request(&self, number: u64) {
        self.state.borrow_mut().existing = Some(RequestRef {
            number,
            url: format!("https://example.test/pull/{number}"),
        });
    }

    pub fn fail_next_push(&self, msg: &str) {
        self.state.borrow_mut().push_failures.push_back(msg.to_string());
    }

    pub fn fail_next_create(&self, msg: &str) {
        self.state
            .borrow_mut()
            .create_failures
            .push_back(msg.to_string());
    }

    pub fn script_checks(&self, snapshots: Vec<std::result::Result<Vec<RemoteCheck>, String>>) {
        self.state.borrow_mut().checks.extend(snapshots);
    }

    pub fn set_default_checks(&self, checks: Vec<RemoteCheck>) {
        self.state.borrow_mut().default_checks = checks;
    }

    pub fn set_run_log(&self, run_id: u64, log: &str) {
        self.state
            .borrow_mut()
            .run_logs
            .insert(run_id, log.to_string());
    }

    /// After every push, keep reporting the previous head (and its checks) for `polls` queries.
    pub fn lag_request_head(&self, polls: usize) {
        self.state.borrow_mut().lag_polls = polls;
    }

    pub fn set_pending_changes(&self, count: usize) {
        self.state.borrow_mut().pending_changes = count;
    }

    pub fn create_calls(&self) -> usize {
        self.state.borrow().create_calls
    }

    pub fn push_calls(&self) -> usize {
        self.state.borrow().push_calls
    }

    pub fn record_calls(&self) -> usize {
        self.state.borrow().record_calls
    }

    pub fn check_calls(&self) -> usize {
        self.state.borrow().check_calls
    }

    pub fn bodies(&self) -> Vec<String> {
        self.state.borrow().bodies.clone()
    }
}

impl Hosting for FakeHosting {
    fn ensure_branch(&self, _branch: &str) -> Result<()> {
        Ok(())
    }

    fn record_change(&self, _message: &str) -> Result<bool> {
        let mut state = self.state.borrow_mut();
        state.record_calls += 1;
        state.head += 1;
        Ok(true)
    }

    fn pending_changes(&self) -> Result<usize> {
        Ok(self.state.borrow().pending_changes)
    }

    fn push(&self, _branch: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.push_calls += 1;
        if let Some(msg) = state.push_failures.pop_front() {
            return Err(anyhow!(msg));
        }
        if state.lag_polls > 0 {
            state.head_lag = state.lag_polls;
        } else {
            state.request_head = state.head;
        }
        Ok(())
    }

    fn head_commit(&self) -> Result<String> {
        Ok(commit_id(self.state.borrow().head))
    }

    fn create_request(&self, _branch: &str, _title: &str, _body: &str) -> Result<CreateRequest> {
        let mut state = self.state.borrow_mut();
        state.create_calls += 1;
        if let Some(msg) = state.create_failures.pop_front() {
            return Err(anyhow!(msg));
        }
        if state.existing.is_some() {
            return Ok(CreateRequest::AlreadyExists);
        }
        let number = state.next_number;
        state.next_number += 1;
        let created = RequestRef {
            number,
            url: format!("https://example.test/pull/{number}"),
        };
        state.existing = Some(created.clone());
        Ok(CreateRequest::Created(created))
    }

    fn get_request(&self, _branch: &str) -> Result<Option<RequestRef>> {
        Ok(self.state.borrow().existing.clone())
    }

    fn update_request_body(&self, _number: u64, body: &str) -> Result<()> {
        self.state.borrow_mut().bodies.push(body.to_string());
        Ok(())
    }

    fn check_states(&self, _branch: &str) -> Result<CheckSnapshot> {
        let mut state = self.state.borrow_mut();
        state.check_calls += 1;
        if state.head_lag > 0 {
            state.head_lag -= 1;
            let stale = CheckSnapshot {
                head: commit_id(state.request_head),
                checks: state.last_checks.clone(),
            };
            if state.head_lag == 0 {
                state.request_head = state.head;
            }
            return Ok(stale);
        }
        let checks = match state.checks.pop_front() {
            Some(Ok(checks)) => checks,
            Some(Err(msg)) => return Err(anyhow!(msg)),
            None => state.default_checks.clone(),
        };
        state.last_checks = checks.clone();
        Ok(CheckSnapshot {
            head: commit_id(state.request_head),
            checks,
        })
    }

    fn failed_run_log(&self, run_id: u64) -> Result<String> {
        self.state
            .borrow()
            .run_logs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| anyhow!("run {run_id} has no log"))
    }
}

/// Virtual clock: `sleep` advances time instantly.
pub struct ManualClock {
    base: Instant,
    elapsed: Cell<Duration>,
    cancel_at: RefCell<Option<(Duration, CancelToken)>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            elapsed: Cell::new(Duration::ZERO),
            cancel_at: RefCell::new(None),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }

    /// Trip `token` once virtual time reaches `at`.
    pub fn cancel_after(&self, at: Duration, token: CancelToken) {
        *self.cancel_at.borrow_mut() = Some((at, token));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed.get()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        self.elapsed.set(self.elapsed.get() + duration);
        if let Some((at, token)) = self.cancel_at.borrow().as_ref()
            && self.elapsed.get() >= *at
        {
            token.cancel();
        }
        Ok(())
    }
}

/// Notifier that keeps every message.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: RefCell<Vec<String>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records messages but reports every send as failed.
    pub fn failing() -> Self {
        Self {
            messages: RefCell::new(Vec::new()),
            fail: true,
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.borrow().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, message: &str) -> Result<()> {
        self.messages.borrow_mut().push(message.to_string());
        if self.fail {
            return Err(anyhow!("notification channel unavailable"));
        }
        Ok(())
    }
}

/// Evaluator returning a fixed score, or an error when built with `failing`.
pub struct FixedEvaluator {
    score: Option<Score>,
    calls: RefCell<Vec<PathBuf>>,
}

impl FixedEvaluator {
    pub fn passing(overall: f64) -> Self {
        let mut criteria = BTreeMap::new();
        criteria.insert(
            "build_passes".to_string(),
            CriterionScore {
                score: 1.0,
                reason: "CI green".to_string(),
            },
        );
        Self {
            score: Some(Score {
                run_id: None,
                verdict: Verdict::from_overall(overall),
                overall_score: overall,
                criteria,
                scorer: Some("fixed".to_string()),
            }),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            score: None,
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.borrow().clone()
    }
}

impl Evaluator for FixedEvaluator {
    fn score(&self, run_dir: &Path) -> Result<Score> {
        self.calls.borrow_mut().push(run_dir.to_path_buf());
        self.score
            .clone()
            .ok_or_else(|| anyhow!("scorer crashed"))
    }
}
