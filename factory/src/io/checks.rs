//! Local verification: named checks or a single override script.
//!
//! Every configured check runs even after one fails, so the agent sees all
//! problems at once. Output from each check is appended to one iteration log.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::{CancelToken, is_cancelled};
use crate::core::checks::{ProjectMarkers, ResolvedCheck, resolve_check};
use crate::core::types::CheckOutcome;
use crate::io::config::Verification;
use crate::io::process::run_command_with_timeout;

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub iteration: u32,
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait Verifier {
    fn verify(&self, request: &VerifyRequest) -> Result<CheckOutcome>;
}

/// Runs checks as shell commands in the working directory.
pub struct LocalVerifier {
    verification: Verification,
    cancel: CancelToken,
}

impl LocalVerifier {
    pub fn new(verification: Verification, cancel: CancelToken) -> Self {
        Self {
            verification,
            cancel,
        }
    }
}

/// One check after resolution.
struct Step {
    name: String,
    action: StepAction,
}

enum StepAction {
    Run(Command, String),
    Pass,
    Fail(String),
}

struct StepResult {
    passed: bool,
    section: String,
}

impl Verifier for LocalVerifier {
    #[instrument(skip_all, fields(iteration = request.iteration))]
    fn verify(&self, request: &VerifyRequest) -> Result<CheckOutcome> {
        let steps = self.plan(&request.workdir);
        info!(checks = steps.len(), "running local checks");

        let mut log = String::new();
        let mut failed_checks = Vec::new();
        let mut failed_sections = String::new();
        for step in steps {
            let name = step.name.clone();
            let result = self.run_step(step, request)?;
            log.push_str(&result.section);
            if !result.passed {
                failed_sections.push_str(&result.section);
                failed_checks.push(name);
            }
        }

        write_checks_log(&request.log_path, &log)?;
        if failed_checks.is_empty() {
            debug!("all local checks passed");
            Ok(CheckOutcome::Passed)
        } else {
            warn!(failed = ?failed_checks, "local checks failed");
            Ok(CheckOutcome::Failed {
                captured_output: failed_sections,
                failed_checks,
            })
        }
    }
}

impl LocalVerifier {
    fn plan(&self, workdir: &Path) -> Vec<Step> {
        match &self.verification {
            Verification::Script(script) => {
                let mut cmd = Command::new("sh");
                cmd.arg(script);
                vec![Step {
                    name: script.display().to_string(),
                    action: StepAction::Run(cmd, format!("sh {}", script.display())),
                }]
            }
            Verification::Checks(names) => {
                let markers = detect_markers(workdir);
                names
                    .iter()
                    .map(|name| {
                        let action = match resolve_check(name, &markers) {
                            ResolvedCheck::Shell(script) => {
                                let mut cmd = Command::new("sh");
                                cmd.arg("-c").arg(&script);
                                StepAction::Run(cmd, script)
                            }
                            ResolvedCheck::Noop => StepAction::Pass,
                            ResolvedCheck::Unresolvable(msg) => StepAction::Fail(msg),
                        };
                        Step {
                            name: name.clone(),
                            action,
                        }
                    })
                    .collect()
            }
        }
    }

    fn run_step(&self, step: Step, request: &VerifyRequest) -> Result<StepResult> {
        let (mut cmd, command_line) = match step.action {
            StepAction::Pass => {
                return Ok(StepResult {
                    passed: true,
                    section: format!("=== {}: passed (noop) ===\n\n", step.name),
                });
            }
            StepAction::Fail(msg) => {
                return Ok(StepResult {
                    passed: false,
                    section: format!("=== {}: failed ===\n{msg}\n\n", step.name),
                });
            }
            StepAction::Run(cmd, command_line) => (cmd, command_line),
        };
        cmd.current_dir(&request.workdir);
        debug!(check = %step.name, command = %command_line, "running check");

        match run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
            &self.cancel,
        ) {
            Ok(output) => {
                let passed = output.success();
                let verdict = if output.timed_out {
                    "timed out".to_string()
                } else {
                    match output.status.code() {
                        Some(code) => format!("exit {code}"),
                        None => "killed".to_string(),
                    }
                };
                Ok(StepResult {
                    passed,
                    section: format!(
                        "=== {} ({command_line}): {verdict} ===\n{}\n",
                        step.name,
                        output.combined(&step.name)
                    ),
                })
            }
            Err(err) if is_cancelled(&err) => Err(err),
            Err(err) => Ok(StepResult {
                passed: false,
                section: format!(
                    "=== {} ({command_line}): could not run ===\n{err:#}\n\n",
                    step.name
                ),
            }),
        }
    }
}

/// Detect build files at the root of `workdir`.
pub fn detect_markers(workdir: &Path) -> ProjectMarkers {
    ProjectMarkers {
        flutter: workdir.join("pubspec.yaml").exists(),
        node: workdir.join("package.json").exists(),
        cargo: workdir.join("Cargo.toml").exists(),
        justfile: workdir.join("justfile").exists() || workdir.join("Justfile").exists(),
        makefile: workdir.join("Makefile").exists(),
    }
}

fn write_checks_log(path: &Path, log: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create checks log dir {}", parent.display()))?;
    }
    fs::write(path, log).with_context(|| format!("write checks log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &Path) -> VerifyRequest {
        VerifyRequest {
            iteration: 1,
            workdir: dir.to_path_buf(),
            log_path: dir.join("checks-iter-1.log"),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        }
    }

    fn checks(names: &[&str]) -> Verification {
        Verification::Checks(names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn all_passing_checks_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = LocalVerifier::new(checks(&["noop", "true"]), CancelToken::new());
        let outcome = verifier.verify(&request(temp.path())).expect("verify");
        assert_eq!(outcome, CheckOutcome::Passed);
        let log = fs::read_to_string(temp.path().join("checks-iter-1.log")).expect("log");
        assert!(log.contains("=== noop: passed (noop) ==="));
        assert!(log.contains("=== true (true): exit 0 ==="));
    }

    #[test]
    fn collects_every_failure_and_keeps_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = LocalVerifier::new(
            checks(&[
                "echo first broke; exit 1",
                "touch ran-second",
                "echo third broke >&2; exit 2",
            ]),
            CancelToken::new(),
        );
        let outcome = verifier.verify(&request(temp.path())).expect("verify");
        assert!(temp.path().join("ran-second").exists());
        match outcome {
            CheckOutcome::Failed {
                captured_output,
                failed_checks,
            } => {
                assert_eq!(failed_checks.len(), 2);
                assert!(captured_output.contains("first broke"));
                assert!(captured_output.contains("third broke"));
                assert!(!captured_output.contains("touch ran-second"));
            }
            CheckOutcome::Passed => panic!("expected failure"),
        }
    }

    #[test]
    fn override_script_replaces_checks() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("verify.sh"), "echo custom; exit 4\n").expect("script");
        let verifier = LocalVerifier::new(
            Verification::Script(PathBuf::from("verify.sh")),
            CancelToken::new(),
        );
        match verifier.verify(&request(temp.path())).expect("verify") {
            CheckOutcome::Failed {
                captured_output, ..
            } => {
                assert!(captured_output.contains("custom"));
                assert!(captured_output.contains("exit 4"));
            }
            CheckOutcome::Passed => panic!("expected failure"),
        }
    }

    #[test]
    fn known_check_without_project_fails_with_explanation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = LocalVerifier::new(checks(&["analyze"]), CancelToken::new());
        match verifier.verify(&request(temp.path())).expect("verify") {
            CheckOutcome::Failed {
                captured_output,
                failed_checks,
            } => {
                assert_eq!(failed_checks, vec!["analyze".to_string()]);
                assert!(captured_output.contains("pubspec.yaml"));
            }
            CheckOutcome::Passed => panic!("expected failure"),
        }
    }

    #[test]
    fn detects_project_markers() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("pubspec.yaml"), "name: app\n").expect("write");
        fs::write(temp.path().join("Makefile"), "test:\n").expect("write");
        let markers = detect_markers(temp.path());
        assert!(markers.flutter);
        assert!(markers.makefile);
        assert!(!markers.node);
    }
}
