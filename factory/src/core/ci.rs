//! Pure classification of remote check states.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{CheckState, FailedCheck, RemoteCheck};

static ACTIONS_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/actions/runs/(\d+)").expect("actions run regex is valid"));

/// Verdict for one snapshot of attached checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    Pending,
    Passed,
    Failed(Vec<RemoteCheck>),
}

/// Classify a snapshot of remote checks.
///
/// No attached checks counts as pending: CI may not have registered yet.
/// A snapshot only resolves once nothing is pending; then any failure wins.
pub fn classify(checks: &[RemoteCheck]) -> Snapshot {
    if checks.is_empty() || checks.iter().any(|c| c.state == CheckState::Pending) {
        return Snapshot::Pending;
    }
    let failed: Vec<RemoteCheck> = checks
        .iter()
        .filter(|c| c.state == CheckState::Failure)
        .cloned()
        .collect();
    if failed.is_empty() {
        Snapshot::Passed
    } else {
        Snapshot::Failed(failed)
    }
}

/// Map a check run's `status` and `conclusion` to a check state.
///
/// Cancelled and timed-out runs count as failures; the change did not get a green run.
pub fn state_from_check_run(status: &str, conclusion: &str) -> CheckState {
    if !status.eq_ignore_ascii_case("completed") {
        return CheckState::Pending;
    }
    match conclusion.to_ascii_uppercase().as_str() {
        "SUCCESS" | "NEUTRAL" => CheckState::Success,
        "SKIPPED" => CheckState::Skipped,
        "" => CheckState::Pending,
        _ => CheckState::Failure,
    }
}

/// Map a commit status context `state` to a check state.
pub fn state_from_status_context(state: &str) -> CheckState {
    match state.to_ascii_uppercase().as_str() {
        "SUCCESS" => CheckState::Success,
        "FAILURE" | "ERROR" => CheckState::Failure,
        _ => CheckState::Pending,
    }
}

/// Extract a GitHub Actions run id from a check link.
pub fn run_id_from_link(link: &str) -> Option<u64> {
    ACTIONS_RUN_RE
        .captures(link)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Keep the last `max_lines` lines of `text`.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Human-readable failure detail handed back to the agent.
pub fn render_failure_detail(failed: &[FailedCheck]) -> String {
    let mut out = String::new();
    for check in failed {
        out.push_str(&format!("CI check '{}' failed", check.name));
        if let Some(link) = &check.link {
            out.push_str(&format!(" ({link})"));
        }
        out.push('\n');
        if let Some(tail) = &check.log_tail
            && !tail.trim().is_empty()
        {
            out.push_str("--- log tail ---\n");
            out.push_str(tail.trim_end());
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATES: [CheckState; 4] = [
        CheckState::Pending,
        CheckState::Success,
        CheckState::Failure,
        CheckState::Skipped,
    ];

    fn check(name: &str, state: CheckState) -> RemoteCheck {
        RemoteCheck {
            name: name.to_string(),
            state,
            link: None,
        }
    }

    fn all_multisets(max_len: usize) -> Vec<Vec<CheckState>> {
        let mut out = vec![Vec::new()];
        let mut frontier = vec![Vec::new()];
        for _ in 0..max_len {
            let mut next = Vec::new();
            for prefix in &frontier {
                for state in STATES {
                    let mut set: Vec<CheckState> = prefix.clone();
                    set.push(state);
                    next.push(set);
                }
            }
            out.extend(next.iter().cloned());
            frontier = next;
        }
        out
    }

    #[test]
    fn classification_holds_for_every_small_multiset() {
        for states in all_multisets(4) {
            let checks: Vec<RemoteCheck> = states
                .iter()
                .enumerate()
                .map(|(i, s)| check(&format!("c{i}"), *s))
                .collect();
            let verdict = classify(&checks);
            let pending = states.iter().any(|s| *s == CheckState::Pending);
            let failures = states.iter().filter(|s| **s == CheckState::Failure).count();
            if states.is_empty() || pending {
                assert_eq!(verdict, Snapshot::Pending, "{states:?}");
            } else if failures > 0 {
                match verdict {
                    Snapshot::Failed(failed) => assert_eq!(failed.len(), failures),
                    other => panic!("expected failed for {states:?}, got {other:?}"),
                }
            } else {
                assert_eq!(verdict, Snapshot::Passed, "{states:?}");
            }
        }
    }

    #[test]
    fn check_runs_map_to_states() {
        assert_eq!(state_from_check_run("COMPLETED", "SUCCESS"), CheckState::Success);
        assert_eq!(state_from_check_run("COMPLETED", "NEUTRAL"), CheckState::Success);
        assert_eq!(state_from_check_run("COMPLETED", "FAILURE"), CheckState::Failure);
        assert_eq!(state_from_check_run("COMPLETED", "CANCELLED"), CheckState::Failure);
        assert_eq!(state_from_check_run("COMPLETED", "TIMED_OUT"), CheckState::Failure);
        assert_eq!(state_from_check_run("COMPLETED", "SKIPPED"), CheckState::Skipped);
        assert_eq!(state_from_check_run("IN_PROGRESS", ""), CheckState::Pending);
        assert_eq!(state_from_check_run("QUEUED", "FAILURE"), CheckState::Pending);
    }

    #[test]
    fn status_contexts_map_to_states() {
        assert_eq!(state_from_status_context("SUCCESS"), CheckState::Success);
        assert_eq!(state_from_status_context("ERROR"), CheckState::Failure);
        assert_eq!(state_from_status_context("failure"), CheckState::Failure);
        assert_eq!(state_from_status_context("PENDING"), CheckState::Pending);
        assert_eq!(state_from_status_context("EXPECTED"), CheckState::Pending);
    }

    #[test]
    fn extracts_actions_run_id() {
        let link = "https://github.com/acme/app/actions/runs/987654/job/123";
        assert_eq!(run_id_from_link(link), Some(987_654));
        assert_eq!(run_id_from_link("https://ci.example.com/build/1"), None);
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail_lines("a\nb\nc\nd", 2), "c\nd");
        assert_eq!(tail_lines("a", 5), "a");
    }

    #[test]
    fn failure_detail_names_checks_and_includes_tail() {
        let detail = render_failure_detail(&[FailedCheck {
            name: "test".to_string(),
            link: Some("https://example.test/run/1".to_string()),
            log_tail: Some("assertion failed".to_string()),
        }]);
        assert!(detail.contains("CI check 'test' failed (https://example.test/run/1)"));
        assert!(detail.contains("assertion failed"));
    }
}
