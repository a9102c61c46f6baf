//! Data types shared by the controller, its collaborators and the run artifacts.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::feedback::FeedbackEntry;

/// Result of running local verification for one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    Passed,
    Failed {
        /// Combined, labelled output of every check that ran.
        captured_output: String,
        /// Names of the checks that failed, in execution order.
        failed_checks: Vec<String>,
    },
}

impl CheckOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, CheckOutcome::Passed)
    }
}

/// An open change request as reported by the hosting service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRef {
    pub number: u64,
    pub url: String,
}

/// Outcome of asking the hosting service to open a change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateRequest {
    Created(RequestRef),
    /// A request for the branch is already open.
    AlreadyExists,
}

/// The change request a run pushes to.
///
/// Created on the first iteration that passes local verification and reused by
/// every later submission of the same run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionHandle {
    pub branch: String,
    pub number: u64,
    pub url: String,
    /// True when this run opened the request, false when it adopted an existing one.
    pub freshly_created: bool,
    /// Commit published by the latest push; CI results for other commits are ignored.
    #[serde(default)]
    pub head: String,
}

/// Checks attached to a change request, with the commit the request pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSnapshot {
    pub head: String,
    pub checks: Vec<RemoteCheck>,
}

/// State of a single remote check attached to a change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Pending,
    Success,
    Failure,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCheck {
    pub name: String,
    pub state: CheckState,
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCheck {
    pub name: String,
    pub link: Option<String>,
    /// Tail of the failed job log, when it could be fetched.
    pub log_tail: Option<String>,
}

/// Aggregate CI verdict for a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CiStatus {
    Pending,
    Passed,
    Failed { checks: Vec<FailedCheck> },
    TimedOut,
}

/// What happened when the generation agent was invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AgentOutcome {
    Completed {
        /// Uncommitted working-tree entries after the agent ran; `None` when unknown.
        changed_paths: Option<usize>,
    },
    Failed {
        error: String,
    },
}

/// Append-only record of one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub ordinal: u32,
    /// Feedback given to the agent at the start of this iteration.
    pub feedback_in: Vec<FeedbackEntry>,
    pub agent: Option<AgentOutcome>,
    pub checks: Option<CheckOutcome>,
    pub submission: Option<SubmissionHandle>,
    pub submission_error: Option<String>,
    pub ci: Option<CiStatus>,
    /// Failure feedback produced by this iteration; empty when it succeeded.
    pub feedback_out: Vec<FeedbackEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when the iteration was aborted by an unrecoverable error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IterationRecord {
    pub fn start(ordinal: u32, feedback_in: Vec<FeedbackEntry>) -> Self {
        Self {
            ordinal,
            feedback_in,
            agent: None,
            checks: None,
            submission: None,
            submission_error: None,
            ci: None,
            feedback_out: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    CiTimeout,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::CiTimeout => "ci_timeout",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality verdict derived from the overall score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    NeedsWork,
    Fail,
}

impl Verdict {
    pub fn from_overall(overall: f64) -> Self {
        if overall >= 0.7 {
            Verdict::Pass
        } else if overall >= 0.4 {
            Verdict::NeedsWork
        } else {
            Verdict::Fail
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::NeedsWork => "NEEDS_WORK",
            Verdict::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub score: f64,
    pub reason: String,
}

/// Score record produced by the post-run evaluator (`score.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub verdict: Verdict,
    pub overall_score: f64,
    pub criteria: BTreeMap<String, CriterionScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scorer: Option<String>,
}

/// Terminal record of a run (`result.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub iterations_used: u32,
    pub max_iterations: u32,
    pub branch: String,
    pub request: Option<SubmissionHandle>,
    pub model: String,
    pub score: Option<Score>,
    pub task_title: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub run_dir: PathBuf,
}
