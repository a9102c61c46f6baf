//! Structured failure feedback carried from one iteration to the next.
//!
//! Entries stay typed until the prompt is rendered, so the origin of each
//! failure (local checks, submission, CI, the agent itself) is never lost.

use serde::{Deserialize, Serialize};

use crate::core::types::{CheckOutcome, FailedCheck};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSource {
    LocalChecks,
    Submission,
    Ci,
    Agent,
}

impl FeedbackSource {
    fn heading(self) -> &'static str {
        match self {
            FeedbackSource::LocalChecks => "Local checks failed",
            FeedbackSource::Submission => "Submission failed",
            FeedbackSource::Ci => "CI failed",
            FeedbackSource::Agent => "Agent problem",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub source: FeedbackSource,
    /// Iteration that produced this entry.
    pub iteration: u32,
    pub text: String,
}

impl FeedbackEntry {
    pub fn new(source: FeedbackSource, iteration: u32, text: impl Into<String>) -> Self {
        Self {
            source,
            iteration,
            text: text.into(),
        }
    }

    /// Feedback for a failed local verification; `None` when checks passed.
    pub fn from_checks(iteration: u32, outcome: &CheckOutcome) -> Option<Self> {
        match outcome {
            CheckOutcome::Passed => None,
            CheckOutcome::Failed {
                captured_output, ..
            } => Some(Self::new(
                FeedbackSource::LocalChecks,
                iteration,
                captured_output.clone(),
            )),
        }
    }

    pub fn from_ci_failures(iteration: u32, failed: &[FailedCheck]) -> Self {
        Self::new(
            FeedbackSource::Ci,
            iteration,
            crate::core::ci::render_failure_detail(failed),
        )
    }
}

/// Flatten entries into markdown sections for the generation prompt.
///
/// Entry text is reproduced verbatim inside fenced blocks.
pub fn render(entries: &[FeedbackEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        if !out.is_empty() {
            out.push('\n');
        }
        let text = entry.text.trim_end();
        let fence = fence_for(text);
        out.push_str(&format!(
            "### {} (iteration {})\n\n{fence}\n{text}\n{fence}\n",
            entry.source.heading(),
            entry.iteration,
        ));
    }
    out
}

/// A backtick fence longer than any backtick run inside `text`.
fn fence_for(text: &str) -> String {
    let longest = text
        .split(|c| c != '`')
        .map(str::len)
        .max()
        .unwrap_or(0);
    "`".repeat((longest + 1).max(3))
}
