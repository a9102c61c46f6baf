//! End-to-end controller scenarios with scripted collaborators.
//!
//! Each test drives `factory::run::execute` through a full run: prompts, local
//! checks, submission, CI polling on a virtual clock, result persistence,
//! evaluation and notification.

use std::time::Duration;

use factory::core::cancel::CancelToken;
use factory::core::feedback::FeedbackSource;
use factory::core::types::{CheckState, CiStatus, RunResult, RunStatus, Verdict};
use factory::io::config::RunConfig;
use factory::io::run_dir::RunDir;
use factory::run::{Collaborators, execute};
use factory::test_support::{
    AgentStep, FakeHosting, FixedEvaluator, ManualClock, RecordingNotifier, ScriptedAgent,
    ScriptedVerifier, failed_checks, remote_check, run_config,
};

struct Harness {
    agent: ScriptedAgent,
    verifier: ScriptedVerifier,
    host: FakeHosting,
    clock: ManualClock,
    evaluator: FixedEvaluator,
    notifier: RecordingNotifier,
}

impl Harness {
    fn new(agent: ScriptedAgent, verifier: ScriptedVerifier) -> Self {
        Self {
            agent,
            verifier,
            host: FakeHosting::new(),
            clock: ManualClock::new(),
            evaluator: FixedEvaluator::passing(0.9),
            notifier: RecordingNotifier::new(),
        }
    }

    fn run(&self, config: &RunConfig, cancel: &CancelToken) -> RunResult {
        let parts = Collaborators {
            agent: &self.agent,
            verifier: &self.verifier,
            host: &self.host,
            clock: &self.clock,
            evaluator: Some(&self.evaluator),
            notifier: &self.notifier,
        };
        execute(config, &parts, cancel).expect("run")
    }
}

fn ci_failure(name: &str, run_id: u64) -> factory::core::types::RemoteCheck {
    let mut check = remote_check(name, CheckState::Failure);
    check.link = Some(format!(
        "https://github.com/acme/app/actions/runs/{run_id}/job/1"
    ));
    check
}

/// A: local checks pass, CI passes on the second poll.
#[test]
fn scenario_a_first_attempt_succeeds() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = run_config(temp.path());
    let harness = Harness::new(ScriptedAgent::default(), ScriptedVerifier::default());
    harness.host.script_checks(vec![
        Ok(vec![remote_check("build", CheckState::Pending)]),
        Ok(vec![remote_check("build", CheckState::Success)]),
    ]);

    let result = harness.run(&config, &CancelToken::new());

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.iterations_used, 1);
    assert_eq!(harness.host.check_calls(), 2);
    assert_eq!(harness.host.create_calls(), 1);
    let request = result.request.as_ref().expect("request");
    assert!(request.freshly_created);

    let run_dir = RunDir::open(&config.run_dir);
    let stored = run_dir.load_result().expect("result.json");
    assert_eq!(stored, result);
    assert_eq!(
        stored.score.as_ref().map(|score| score.verdict),
        Some(Verdict::Pass)
    );
    assert!(run_dir.task_path().is_file());
    assert!(run_dir.config_path().is_file());
    assert!(run_dir.ci_snapshot_path(1).is_file());

    let bodies = harness.host.bodies();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("Status: success after 1 of 3 iterations"));
    let messages = harness.notifier.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains(&request.url));
}

/// B: local checks fail twice with different errors, then pass; CI passes.
#[test]
fn scenario_b_local_failures_feed_the_next_prompt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = run_config(temp.path());
    let harness = Harness::new(
        ScriptedAgent::default(),
        ScriptedVerifier::new(vec![
            failed_checks("lib/a.dart:3:1 error: missing semicolon"),
            failed_checks("test/widget_test.dart: expected blue, got red"),
        ]),
    );
    harness
        .host
        .set_default_checks(vec![remote_check("build", CheckState::Success)]);

    let result = harness.run(&config, &CancelToken::new());

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.iterations_used, 3);

    let prompts = harness.agent.prompts();
    assert_eq!(prompts.len(), 3);
    assert!(!prompts[0].contains("Previous attempt failed"));
    assert!(prompts[1].contains("missing semicolon"));
    assert!(prompts[2].contains("expected blue, got red"));
    assert!(!prompts[2].contains("missing semicolon"));

    let records = RunDir::open(&config.run_dir)
        .load_iterations()
        .expect("iterations");
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].feedback_in, records[0].feedback_out);
    assert!(records[2].feedback_out.is_empty());
    assert!(records[0].submission.is_none());
    // Only the passing iteration was submitted.
    assert_eq!(harness.host.push_calls(), 1);
    assert_eq!(harness.host.create_calls(), 1);
}

/// B with CI disabled: two local failures, success on the third of five iterations.
#[test]
fn scenario_b_without_ci_succeeds_on_third_attempt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = run_config(temp.path());
    config.max_iterations = 5;
    config.skip_ci = true;
    let harness = Harness::new(
        ScriptedAgent::default(),
        ScriptedVerifier::new(vec![
            failed_checks("lib/a.dart:3:1 error: missing semicolon"),
            failed_checks("test/widget_test.dart: expected blue, got red"),
        ]),
    );

    let result = harness.run(&config, &CancelToken::new());

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.iterations_used, 3);
    assert_eq!(harness.host.check_calls(), 0);
    assert!(harness.agent.prompts()[1].contains("missing semicolon"));
    let records = RunDir::open(&config.run_dir)
        .load_iterations()
        .expect("iterations");
    assert!(records[2].feedback_out.is_empty());
    assert_eq!(records[2].ci, None);
}

/// C: CI always fails; the budget runs out after three submissions of one request.
#[test]
fn scenario_c_ci_always_failing_exhausts_budget() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = run_config(temp.path());
    let harness = Harness::new(ScriptedAgent::default(), ScriptedVerifier::default());
    harness.host.set_default_checks(vec![ci_failure("test", 21)]);

    let result = harness.run(&config, &CancelToken::new());

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.iterations_used, 3);
    assert_eq!(harness.agent.calls(), 3);
    assert_eq!(harness.host.push_calls(), 3);
    assert_eq!(harness.host.create_calls(), 1);

    let records = RunDir::open(&config.run_dir)
        .load_iterations()
        .expect("iterations");
    let submissions: Vec<_> = records
        .iter()
        .filter_map(|record| record.submission.as_ref())
        .collect();
    assert_eq!(submissions.len(), 3);
    assert!(submissions.iter().all(|s| s.number == submissions[0].number));
    assert_ne!(submissions[0].head, submissions[1].head);
    assert_ne!(submissions[1].head, submissions[2].head);

    let bodies = harness.host.bodies();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("Status: failed after 3 of 3 iterations"));
    assert!(harness.evaluator.calls().is_empty());
}

/// An artifact that cannot be written ends the run as failed, with a result.
#[test]
fn unwritable_artifact_still_records_failed_result() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = run_config(temp.path());
    let blocked = RunDir::create(&config.run_dir)
        .expect("run dir")
        .ci_snapshot_path(1);
    std::fs::create_dir_all(blocked.join("occupied")).expect("block snapshot path");
    let harness = Harness::new(ScriptedAgent::default(), ScriptedVerifier::default());
    harness
        .host
        .set_default_checks(vec![remote_check("build", CheckState::Success)]);

    let result = harness.run(&config, &CancelToken::new());

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.iterations_used, 1);
    assert_eq!(harness.agent.calls(), 1);
    let stored = RunDir::open(&config.run_dir)
        .load_result()
        .expect("result.json");
    assert_eq!(stored.status, RunStatus::Failed);
    let records = RunDir::open(&config.run_dir)
        .load_iterations()
        .expect("iterations");
    let error = records[0].error.as_deref().expect("abort reason");
    assert!(error.contains("ci-iter-1.json"), "{error}");
    assert!(harness.host.bodies()[0].contains("Status: failed after 1 of 3 iterations"));
    assert!(harness.evaluator.calls().is_empty());
    assert_eq!(harness.notifier.messages().len(), 1);
}

/// CI results left over from the previous commit must not fail the new one.
#[test]
fn stale_ci_result_after_retry_push_is_ignored() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = run_config(temp.path());
    let harness = Harness::new(ScriptedAgent::default(), ScriptedVerifier::default());
    harness.host.lag_request_head(1);
    harness.host.script_checks(vec![
        Ok(vec![ci_failure("test", 31)]),
        Ok(vec![remote_check("test", CheckState::Success)]),
    ]);

    let result = harness.run(&config, &CancelToken::new());

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.iterations_used, 2);
    assert_eq!(harness.agent.calls(), 2);
    // One stale and one fresh poll per iteration.
    assert_eq!(harness.host.check_calls(), 4);
}

/// CI fails twice, passes on the third submission of the same request.
#[test]
fn ci_failures_then_pass_reuse_one_request() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = run_config(temp.path());
    let harness = Harness::new(ScriptedAgent::default(), ScriptedVerifier::default());
    harness.host.script_checks(vec![
        Ok(vec![ci_failure("test", 11)]),
        Ok(vec![
            ci_failure("test", 12),
            remote_check("lint", CheckState::Success),
        ]),
        Ok(vec![remote_check("test", CheckState::Success)]),
    ]);
    harness
        .host
        .set_run_log(11, "running tests\nExpected: blue\nActual: red");

    let result = harness.run(&config, &CancelToken::new());

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.iterations_used, 3);
    assert_eq!(harness.host.push_calls(), 3);
    assert_eq!(harness.host.create_calls(), 1);

    let run_dir = RunDir::open(&config.run_dir);
    let records = run_dir.load_iterations().expect("iterations");
    let numbers: Vec<u64> = records
        .iter()
        .filter_map(|record| record.submission.as_ref().map(|s| s.number))
        .collect();
    assert_eq!(numbers, vec![numbers[0]; 3]);
    assert!(matches!(records[0].ci, Some(CiStatus::Failed { .. })));
    assert_eq!(records[0].feedback_out[0].source, FeedbackSource::Ci);
    assert!(run_dir.ci_log_path(1).is_file());
    assert!(!run_dir.ci_log_path(3).exists());

    let prompts = harness.agent.prompts();
    assert!(prompts[1].contains("CI check 'test' failed"));
    assert!(prompts[1].contains("Actual: red"));
}

/// D: CI never resolves; the run stops after one iteration.
#[test]
fn scenario_d_ci_timeout_stops_without_retry() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = run_config(temp.path());
    let harness = Harness::new(ScriptedAgent::default(), ScriptedVerifier::default());
    harness
        .host
        .set_default_checks(vec![remote_check("build", CheckState::Pending)]);

    let result = harness.run(&config, &CancelToken::new());

    assert_eq!(result.status, RunStatus::CiTimeout);
    assert_eq!(result.iterations_used, 1);
    assert_eq!(harness.agent.calls(), 1);
    assert_eq!(harness.clock.elapsed(), Duration::from_secs(10 * 60));
    assert!(harness.host.bodies().is_empty());
    assert!(harness.evaluator.calls().is_empty());
    assert_eq!(result.score, None);
    assert!(harness.notifier.messages()[0].contains("CI did not finish in time"));
    assert_eq!(
        RunDir::open(&config.run_dir)
            .load_result()
            .expect("result")
            .status,
        RunStatus::CiTimeout
    );
}

#[test]
fn generation_count_never_exceeds_budget() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = run_config(temp.path());
    config.max_iterations = 4;
    let harness = Harness::new(
        ScriptedAgent::default(),
        ScriptedVerifier::new((0..10).map(|n| failed_checks(&format!("fail {n}"))).collect()),
    );

    let result = harness.run(&config, &CancelToken::new());

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.iterations_used, 4);
    assert_eq!(harness.agent.calls(), 4);
    assert_eq!(harness.verifier.calls(), 4);
    // No CI poll (or any submission) after a local failure.
    assert_eq!(harness.host.check_calls(), 0);
    assert_eq!(harness.host.push_calls(), 0);
    assert!(harness.notifier.messages()[0].contains("failed"));
}

#[test]
fn disabled_ci_wait_succeeds_without_polling() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = run_config(temp.path());
    config.ci_timeout = Duration::ZERO;
    let harness = Harness::new(ScriptedAgent::default(), ScriptedVerifier::default());

    let result = harness.run(&config, &CancelToken::new());

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.iterations_used, 1);
    assert_eq!(harness.host.check_calls(), 0);
    assert_eq!(harness.host.push_calls(), 1);
}

#[test]
fn failed_push_is_retried_as_next_iteration() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = run_config(temp.path());
    config.skip_ci = true;
    let harness = Harness::new(ScriptedAgent::default(), ScriptedVerifier::default());
    harness.host.fail_next_push("remote rejected (pre-receive hook)");

    let result = harness.run(&config, &CancelToken::new());

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.iterations_used, 2);
    let records = RunDir::open(&config.run_dir)
        .load_iterations()
        .expect("iterations");
    assert!(
        records[0]
            .submission_error
            .as_deref()
            .is_some_and(|err| err.contains("pre-receive hook"))
    );
    assert_eq!(records[0].feedback_out[0].source, FeedbackSource::Submission);
    assert!(harness.agent.prompts()[1].contains("Submission failed"));
}

#[test]
fn cancel_during_ci_wait_records_cancelled() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = run_config(temp.path());
    let harness = Harness::new(ScriptedAgent::default(), ScriptedVerifier::default());
    harness
        .host
        .set_default_checks(vec![remote_check("build", CheckState::Pending)]);
    let cancel = CancelToken::new();
    harness
        .clock
        .cancel_after(Duration::from_secs(90), cancel.clone());

    let result = harness.run(&config, &cancel);

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.iterations_used, 1);
    assert!(harness.evaluator.calls().is_empty());
    assert!(harness.host.bodies().is_empty());
    assert!(harness.notifier.messages()[0].contains("cancelled"));
    assert_eq!(
        RunDir::open(&config.run_dir)
            .load_result()
            .expect("result")
            .status,
        RunStatus::Cancelled
    );
}

#[test]
fn cancel_during_generation_skips_checks() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = run_config(temp.path());
    let cancel = CancelToken::new();
    let harness = Harness::new(
        ScriptedAgent::new(vec![AgentStep::Cancel(cancel.clone())]),
        ScriptedVerifier::default(),
    );

    let result = harness.run(&config, &cancel);

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(harness.verifier.calls(), 0);
    assert_eq!(harness.host.push_calls(), 0);
}
