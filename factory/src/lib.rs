//! Autonomous build-fix-verify controller.
//!
//! A run repeatedly asks a code-generation agent to change a repository,
//! verifies the change locally, submits it as a change request and waits for
//! remote CI. Failures at any stage become feedback for the next attempt.
//! The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (phases, CI classification,
//!   feedback, naming). No I/O.
//! - **[`io`]**: Side-effecting adapters (processes, git, `gh`, the agent CLI,
//!   run artifacts). Each sits behind a trait so tests can script it.
//!
//! Orchestration modules ([`controller`], [`submit`], [`ci_poll`], [`report`],
//! [`run`]) combine the two.

pub mod ci_poll;
pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod report;
pub mod run;
pub mod submit;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
