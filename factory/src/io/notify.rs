//! Notification channel for terminal run summaries.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::core::cancel::CancelToken;
use crate::io::process::run_command_with_timeout;

pub trait Notifier {
    fn send(&self, message: &str) -> Result<()>;
}

/// Pipes the message into a shell command (e.g. a webhook `curl` or `mail`).
pub struct CommandNotifier {
    target: String,
    cancel: CancelToken,
}

impl CommandNotifier {
    pub fn new(target: impl Into<String>, cancel: CancelToken) -> Self {
        Self {
            target: target.into(),
            cancel,
        }
    }
}

impl Notifier for CommandNotifier {
    fn send(&self, message: &str) -> Result<()> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.target);
        let output = run_command_with_timeout(
            cmd,
            Some(message.as_bytes()),
            Duration::from_secs(60),
            10_000,
            &self.cancel,
        )
        .context("run notification command")?;
        if !output.success() {
            bail!(
                "notification command failed with status {:?}: {}",
                output.status.code(),
                output.stderr_lossy().trim()
            );
        }
        Ok(())
    }
}

/// Used when no target is configured: the summary only goes to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, message: &str) -> Result<()> {
        info!(%message, "run summary");
        Ok(())
    }
}
