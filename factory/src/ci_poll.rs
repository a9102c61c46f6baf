//! Bounded polling of remote CI for a submitted change.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::next_sleep;
use crate::core::cancel::{CancelToken, is_cancelled};
use crate::core::ci::{Snapshot, classify, run_id_from_link, tail_lines};
use crate::core::types::{CiStatus, FailedCheck, RemoteCheck, SubmissionHandle};
use crate::io::clock::Clock;
use crate::io::hosting::Hosting;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const LOG_TAIL_LINES: usize = 40;

/// Final CI observation for one iteration (`ci-iter-N.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CiReport {
    pub status: CiStatus,
    /// Last successfully fetched snapshot.
    pub checks: Vec<RemoteCheck>,
    pub polls: u32,
    /// Ticks whose status query failed and were skipped.
    pub skipped_polls: u32,
    /// Ticks where the request still pointed at an earlier commit.
    pub stale_polls: u32,
}

pub struct CiPoller<'a, H: Hosting, C: Clock> {
    host: &'a H,
    clock: &'a C,
    interval: Duration,
}

impl<'a, H: Hosting, C: Clock> CiPoller<'a, H, C> {
    pub fn new(host: &'a H, clock: &'a C, interval: Duration) -> Self {
        Self {
            host,
            clock,
            interval,
        }
    }

    /// Poll until CI resolves or `timeout` elapses.
    ///
    /// A failed status query never counts as a CI failure; the tick is skipped.
    /// Checks reported for any commit other than `handle.head` count as pending.
    /// Only `Cancelled` escapes as an error.
    #[instrument(skip_all, fields(branch = %handle.branch, timeout_secs = timeout.as_secs()))]
    pub fn await_status(
        &self,
        handle: &SubmissionHandle,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CiReport> {
        let deadline = self.clock.now() + timeout;
        let mut report = CiReport {
            status: CiStatus::Pending,
            checks: Vec::new(),
            polls: 0,
            skipped_polls: 0,
            stale_polls: 0,
        };
        info!("waiting for CI");

        loop {
            cancel.check()?;
            report.polls += 1;
            match self.host.check_states(&handle.branch) {
                Err(err) if is_cancelled(&err) => return Err(err),
                Err(err) => {
                    warn!(err = %err, poll = report.polls, "CI status query failed, skipping tick");
                    report.skipped_polls += 1;
                }
                Ok(snapshot) if snapshot.head != handle.head => {
                    debug!(
                        reported = %snapshot.head,
                        pushed = %handle.head,
                        "request head not at pushed commit yet"
                    );
                    report.stale_polls += 1;
                }
                Ok(snapshot) => {
                    let verdict = classify(&snapshot.checks);
                    report.checks = snapshot.checks;
                    match verdict {
                        Snapshot::Pending => {
                            debug!(poll = report.polls, "CI pending");
                        }
                        Snapshot::Passed => {
                            info!(polls = report.polls, "CI passed");
                            report.status = CiStatus::Passed;
                            return Ok(report);
                        }
                        Snapshot::Failed(failed) => {
                            warn!(failed = failed.len(), "CI failed");
                            report.status = CiStatus::Failed {
                                checks: self.describe_failures(&failed),
                            };
                            return Ok(report);
                        }
                    }
                }
            }

            let now = self.clock.now();
            if now >= deadline {
                warn!(polls = report.polls, "CI wait timed out");
                report.status = CiStatus::TimedOut;
                return Ok(report);
            }
            self.clock
                .sleep(next_sleep(self.interval, deadline, now), cancel)?;
        }
    }

    /// Attach log tails where the check links to a fetchable CI run.
    fn describe_failures(&self, failed: &[RemoteCheck]) -> Vec<FailedCheck> {
        let mut logs: BTreeMap<u64, Option<String>> = BTreeMap::new();
        failed
            .iter()
            .map(|check| {
                let log_tail = check
                    .link
                    .as_deref()
                    .and_then(run_id_from_link)
                    .and_then(|run_id| {
                        logs.entry(run_id)
                            .or_insert_with(|| match self.host.failed_run_log(run_id) {
                                Ok(log) => Some(tail_lines(&log, LOG_TAIL_LINES)),
                                Err(err) => {
                                    warn!(run_id, err = %err, "could not fetch failed run log");
                                    None
                                }
                            })
                            .clone()
                    });
                FailedCheck {
                    name: check.name.clone(),
                    link: check.link.clone(),
                    log_tail,
                }
            })
            .collect()
    }
}
