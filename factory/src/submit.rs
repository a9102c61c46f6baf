//! Change submission: commit, push, and open (or adopt) one change request per run.

use anyhow::{Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{CreateRequest, RequestRef, RunStatus, SubmissionHandle};
use crate::io::hosting::Hosting;

/// Text shown in the change request description.
#[derive(Debug, Clone)]
pub struct RequestText {
    pub run_id: String,
    pub title: String,
    pub task: String,
}

impl RequestText {
    pub fn body(&self, status_line: &str) -> String {
        format!(
            "Automated change for: **{}**\n\nRun: `{}`\nStatus: {}\n\n<details><summary>Task</summary>\n\n{}\n\n</details>\n",
            self.title,
            self.run_id,
            status_line,
            self.task.trim()
        )
    }
}

pub struct SubmissionGateway<'a, H: Hosting> {
    host: &'a H,
    text: RequestText,
    handle: Option<SubmissionHandle>,
    /// A create call failed without a definitive answer; look up before retrying.
    lookup_before_create: bool,
}

impl<'a, H: Hosting> SubmissionGateway<'a, H> {
    pub fn new(host: &'a H, text: RequestText) -> Self {
        Self {
            host,
            text,
            handle: None,
            lookup_before_create: false,
        }
    }

    pub fn handle(&self) -> Option<&SubmissionHandle> {
        self.handle.as_ref()
    }

    /// Commit pending changes on `branch`, push, and return the run's change request.
    ///
    /// The request is created at most once per run; later calls reuse it.
    #[instrument(skip_all, fields(branch, iteration))]
    pub fn submit(&mut self, branch: &str, iteration: u32) -> Result<SubmissionHandle> {
        self.host.ensure_branch(branch)?;
        let committed = self.host.record_change(&format!(
            "factory: {} (iteration {iteration})",
            self.text.title
        ))?;
        debug!(committed, "change recorded");
        self.host.push(branch)?;
        let head = self.host.head_commit()?;
        debug!(head = %head, "pushed");

        if let Some(handle) = &mut self.handle {
            debug!(number = handle.number, "reusing change request");
            handle.head = head;
            return Ok(handle.clone());
        }
        let handle = self.open_or_adopt(branch, head)?;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    fn open_or_adopt(&mut self, branch: &str, head: String) -> Result<SubmissionHandle> {
        if self.lookup_before_create
            && let Some(existing) = self.host.get_request(branch)?
        {
            info!(number = existing.number, "adopting change request from earlier attempt");
            return Ok(handle(branch, existing, false, head));
        }

        let body = self.text.body("in progress");
        match self.host.create_request(branch, &self.text.title, &body) {
            Ok(CreateRequest::Created(created)) => Ok(handle(branch, created, true, head)),
            Ok(CreateRequest::AlreadyExists) => match self.host.get_request(branch)? {
                Some(existing) => {
                    info!(number = existing.number, "adopting existing change request");
                    Ok(handle(branch, existing, false, head))
                }
                None => {
                    self.lookup_before_create = true;
                    bail!("change request for {branch} reported as existing but not found")
                }
            },
            Err(err) => {
                warn!(err = %err, "change request creation failed");
                self.lookup_before_create = true;
                Err(err)
            }
        }
    }

    /// Rewrite the request description with the final status.
    pub fn update_description(
        &self,
        status: RunStatus,
        iterations_used: u32,
        max_iterations: u32,
    ) -> Result<()> {
        let Some(handle) = &self.handle else {
            return Ok(());
        };
        let status_line = format!("{status} after {iterations_used} of {max_iterations} iterations");
        self.host
            .update_request_body(handle.number, &self.text.body(&status_line))
    }
}

fn handle(
    branch: &str,
    request: RequestRef,
    freshly_created: bool,
    head: String,
) -> SubmissionHandle {
    SubmissionHandle {
        branch: branch.to_string(),
        number: request.number,
        url: request.url,
        freshly_created,
        head,
    }
}
