//! Prompt composition for each generation attempt.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::feedback::{self, FeedbackEntry};
use crate::io::config::Verification;

const ITERATION_TEMPLATE: &str = include_str!("prompts/iteration.md");

#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub task: &'a str,
    pub iteration: u32,
    pub max_iterations: u32,
    /// Failure feedback from the previous iteration; empty on the first.
    pub feedback: &'a [FeedbackEntry],
    pub verification: &'a Verification,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("iteration", ITERATION_TEMPLATE)
            .context("load iteration prompt template")?;
        Ok(Self { env })
    }

    pub fn render(&self, input: &PromptInputs<'_>) -> Result<String> {
        let template = self.env.get_template("iteration")?;
        let feedback_text = feedback::render(input.feedback);
        let (checks, script) = match input.verification {
            Verification::Checks(names) => (Some(names.clone()), None),
            Verification::Script(path) => (None, Some(path.display().to_string())),
        };
        let rendered = template
            .render(context! {
                task => input.task.trim(),
                iteration => input.iteration,
                max_iterations => input.max_iterations,
                feedback => (!feedback_text.is_empty()).then_some(feedback_text.trim_end()),
                checks => checks,
                script => script,
            })
            .context("render iteration prompt")?;
        debug!(
            iteration = input.iteration,
            bytes = rendered.len(),
            "prompt rendered"
        );
        Ok(rendered)
    }
}
