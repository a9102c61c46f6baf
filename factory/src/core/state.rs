//! Controller phases and the transitions allowed between them.

use serde::Serialize;

use crate::core::types::RunStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Generating,
    LocalChecking,
    Submitting,
    CiWaiting,
    Succeeded,
    FailedTerminal,
    TimedOutTerminal,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        self.terminal_status().is_some()
    }

    pub fn terminal_status(self) -> Option<RunStatus> {
        match self {
            Phase::Succeeded => Some(RunStatus::Success),
            Phase::FailedTerminal => Some(RunStatus::Failed),
            Phase::TimedOutTerminal => Some(RunStatus::CiTimeout),
            Phase::Cancelled => Some(RunStatus::Cancelled),
            Phase::Idle
            | Phase::Generating
            | Phase::LocalChecking
            | Phase::Submitting
            | Phase::CiWaiting => None,
        }
    }
}

/// Whether the controller may move from `from` to `to`.
///
/// Terminal phases have no outgoing edges. Cancellation is reachable from
/// every non-terminal phase, and an aborted iteration may fail the run from
/// any phase once it has started.
pub fn is_valid_transition(from: Phase, to: Phase) -> bool {
    if from.is_terminal() {
        return false;
    }
    if to == Phase::Cancelled {
        return true;
    }
    if to == Phase::FailedTerminal {
        return from != Phase::Idle;
    }
    matches!(
        (from, to),
        (Phase::Idle, Phase::Generating)
            | (Phase::Generating, Phase::LocalChecking)
            | (
                Phase::LocalChecking,
                Phase::Generating | Phase::Submitting | Phase::FailedTerminal
            )
            | (
                Phase::Submitting,
                Phase::Generating | Phase::CiWaiting | Phase::Succeeded | Phase::FailedTerminal
            )
            | (
                Phase::CiWaiting,
                Phase::Generating
                    | Phase::Succeeded
                    | Phase::TimedOutTerminal
                    | Phase::FailedTerminal
            )
    )
}

/// Phase to enter after a failed iteration: retry while budget remains.
pub fn after_failure(ordinal: u32, max_iterations: u32) -> Phase {
    if ordinal >= max_iterations {
        Phase::FailedTerminal
    } else {
        Phase::Generating
    }
}
