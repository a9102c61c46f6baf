//! VCS hosting adapter: branch, commit, push, change requests and CI status.
//!
//! [`GhHosting`] drives `git` for local history and the GitHub CLI (`gh`) for
//! pull requests and check runs.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::core::cancel::CancelToken;
use crate::core::ci::{state_from_check_run, state_from_status_context};
use crate::core::types::{CheckSnapshot, CreateRequest, RemoteCheck, RequestRef};
use crate::io::git::Git;
use crate::io::process::{CommandOutput, run_command_with_timeout};

const GH_OUTPUT_LIMIT_BYTES: usize = 2_000_000;
const STATE_PREFIX: &str = ".factory/";

pub trait Hosting {
    /// Make `branch` exist locally and be checked out.
    fn ensure_branch(&self, branch: &str) -> Result<()>;
    /// Commit all pending working-tree changes; `Ok(false)` when there were none.
    fn record_change(&self, message: &str) -> Result<bool>;
    /// Uncommitted working-tree entries outside the factory state directory.
    fn pending_changes(&self) -> Result<usize>;
    fn push(&self, branch: &str) -> Result<()>;
    /// Commit currently checked out, i.e. what `push` publishes.
    fn head_commit(&self) -> Result<String>;
    fn create_request(&self, branch: &str, title: &str, body: &str) -> Result<CreateRequest>;
    /// The open request whose head is `branch`, if any.
    fn get_request(&self, branch: &str) -> Result<Option<RequestRef>>;
    fn update_request_body(&self, number: u64, body: &str) -> Result<()>;
    /// Checks attached to the request for `branch`, tagged with the request's head commit.
    fn check_states(&self, branch: &str) -> Result<CheckSnapshot>;
    /// Failed-step log of a CI run.
    fn failed_run_log(&self, run_id: u64) -> Result<String>;
}

pub struct GhHosting {
    git: Git,
    remote: String,
    base_branch: Option<String>,
    timeout: Duration,
    cancel: CancelToken,
}

impl GhHosting {
    pub fn new(
        git: Git,
        remote: impl Into<String>,
        base_branch: Option<String>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            git,
            remote: remote.into(),
            base_branch,
            timeout: Duration::from_secs(120),
            cancel,
        }
    }

    fn gh(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("gh");
        cmd.args(args)
            .current_dir(self.git.workdir())
            .env("GH_PROMPT_DISABLED", "1")
            .env("NO_COLOR", "1");
        run_command_with_timeout(
            cmd,
            None,
            self.timeout,
            GH_OUTPUT_LIMIT_BYTES,
            &self.cancel,
        )
        .with_context(|| format!("spawn gh {}", args.join(" ")))
    }

    fn gh_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.gh(args)?;
        if !output.success() {
            bail!(
                "gh {} failed: {}",
                args.join(" "),
                output.stderr_lossy().trim()
            );
        }
        Ok(output.stdout_lossy())
    }
}

impl Hosting for GhHosting {
    fn ensure_branch(&self, branch: &str) -> Result<()> {
        self.git.ensure_branch(branch)
    }

    fn record_change(&self, message: &str) -> Result<bool> {
        self.git.add_all()?;
        self.git.commit_staged(message)
    }

    fn pending_changes(&self) -> Result<usize> {
        Ok(self.git.changes_outside(&[STATE_PREFIX])?.len())
    }

    fn push(&self, branch: &str) -> Result<()> {
        self.git.push(&self.remote, branch)
    }

    fn head_commit(&self) -> Result<String> {
        self.git.head_sha()
    }

    #[instrument(skip_all, fields(branch))]
    fn create_request(&self, branch: &str, title: &str, body: &str) -> Result<CreateRequest> {
        let mut args = vec![
            "pr", "create", "--head", branch, "--title", title, "--body", body,
        ];
        if let Some(base) = &self.base_branch {
            args.extend(["--base", base.as_str()]);
        }
        let output = self.gh(&args)?;
        if !output.success() {
            let stderr = output.stderr_lossy();
            if stderr.contains("already exists") {
                info!(branch, "change request already open");
                return Ok(CreateRequest::AlreadyExists);
            }
            bail!("gh pr create failed: {}", stderr.trim());
        }
        // gh prints the request URL on stdout.
        let url = output
            .stdout_lossy()
            .lines()
            .map(str::trim)
            .rfind(|line| line.starts_with("http"))
            .map(str::to_string)
            .ok_or_else(|| anyhow!("gh pr create printed no URL"))?;
        let number = request_number_from_url(&url)
            .ok_or_else(|| anyhow!("could not parse request number from {url}"))?;
        info!(number, url = %url, "change request created");
        Ok(CreateRequest::Created(RequestRef { number, url }))
    }

    fn get_request(&self, branch: &str) -> Result<Option<RequestRef>> {
        let stdout = self.gh_checked(&[
            "pr", "list", "--head", branch, "--state", "open", "--json", "number,url",
        ])?;
        let mut requests: Vec<RequestRef> =
            serde_json::from_str(stdout.trim()).context("parse gh pr list output")?;
        debug!(branch, found = requests.len(), "looked up change request");
        Ok(if requests.is_empty() {
            None
        } else {
            Some(requests.swap_remove(0))
        })
    }

    fn update_request_body(&self, number: u64, body: &str) -> Result<()> {
        let number = number.to_string();
        self.gh_checked(&["pr", "edit", &number, "--body", body])?;
        Ok(())
    }

    fn check_states(&self, branch: &str) -> Result<CheckSnapshot> {
        let stdout = self.gh_checked(&[
            "pr",
            "view",
            branch,
            "--json",
            "headRefOid,statusCheckRollup",
        ])?;
        parse_pr_checks_json(&stdout)
    }

    fn failed_run_log(&self, run_id: u64) -> Result<String> {
        let run_id = run_id.to_string();
        self.gh_checked(&["run", "view", &run_id, "--log-failed"])
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPrChecks {
    head_ref_oid: String,
    #[serde(default)]
    status_check_rollup: Vec<GhRollupItem>,
}

/// One entry of `statusCheckRollup`: an Actions/App check run or a legacy status.
#[derive(Debug, Deserialize)]
#[serde(tag = "__typename")]
enum GhRollupItem {
    CheckRun {
        name: String,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        conclusion: Option<String>,
        #[serde(default, rename = "detailsUrl")]
        details_url: Option<String>,
    },
    StatusContext {
        context: String,
        #[serde(default)]
        state: Option<String>,
        #[serde(default, rename = "targetUrl")]
        target_url: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// Parse `gh pr view --json headRefOid,statusCheckRollup` output.
pub fn parse_pr_checks_json(raw: &str) -> Result<CheckSnapshot> {
    let view: GhPrChecks = serde_json::from_str(raw.trim()).context("parse gh pr view output")?;
    let checks = view
        .status_check_rollup
        .into_iter()
        .filter_map(|item| match item {
            GhRollupItem::CheckRun {
                name,
                status,
                conclusion,
                details_url,
            } => Some(RemoteCheck {
                state: state_from_check_run(
                    status.as_deref().unwrap_or_default(),
                    conclusion.as_deref().unwrap_or_default(),
                ),
                name,
                link: details_url.filter(|link| !link.is_empty()),
            }),
            GhRollupItem::StatusContext {
                context,
                state,
                target_url,
            } => Some(RemoteCheck {
                state: state_from_status_context(state.as_deref().unwrap_or_default()),
                name: context,
                link: target_url.filter(|link| !link.is_empty()),
            }),
            GhRollupItem::Other => None,
        })
        .collect();
    Ok(CheckSnapshot {
        head: view.head_ref_oid,
        checks,
    })
}

/// `https://github.com/o/r/pull/42` -> 42.
pub fn request_number_from_url(url: &str) -> Option<u64> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|segment| segment.parse().ok())
}
