//! Per-run artifact directory (`.factory/runs/<run-id>/`).
//!
//! Artifacts are product output, independent of `RUST_LOG`:
//!
//! ```text
//! task.md               task description as given
//! config.json           resolved run configuration
//! prompt-iter-N.md      prompt sent to the agent
//! agent-iter-N.log      agent stdout/stderr
//! checks-iter-N.log     local verification output
//! ci-iter-N.json        last CI snapshot for the iteration
//! ci-iter-N.log         CI failure detail (only on failure)
//! iterations.jsonl      append-only iteration records
//! result.json           terminal run result
//! score.json            evaluator output (when scored)
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::types::{IterationRecord, RunResult};
use crate::io::config::STATE_DIR;

#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).with_context(|| format!("create run dir {}", root.display()))?;
        Ok(Self { root })
    }

    /// Open an existing run directory without creating it.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn task_path(&self) -> PathBuf {
        self.root.join("task.md")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn prompt_path(&self, iter: u32) -> PathBuf {
        self.root.join(format!("prompt-iter-{iter}.md"))
    }

    pub fn agent_log_path(&self, iter: u32) -> PathBuf {
        self.root.join(format!("agent-iter-{iter}.log"))
    }

    pub fn checks_log_path(&self, iter: u32) -> PathBuf {
        self.root.join(format!("checks-iter-{iter}.log"))
    }

    pub fn ci_snapshot_path(&self, iter: u32) -> PathBuf {
        self.root.join(format!("ci-iter-{iter}.json"))
    }

    pub fn ci_log_path(&self, iter: u32) -> PathBuf {
        self.root.join(format!("ci-iter-{iter}.log"))
    }

    pub fn iterations_path(&self) -> PathBuf {
        self.root.join("iterations.jsonl")
    }

    pub fn result_path(&self) -> PathBuf {
        self.root.join("result.json")
    }

    pub fn score_path(&self) -> PathBuf {
        self.root.join("score.json")
    }

    pub fn write_task(&self, text: &str) -> Result<()> {
        write_text(&self.task_path(), text)
    }

    pub fn write_prompt(&self, iter: u32, prompt: &str) -> Result<()> {
        write_text(&self.prompt_path(iter), prompt)
    }

    pub fn write_ci_log(&self, iter: u32, text: &str) -> Result<()> {
        write_text(&self.ci_log_path(iter), text)
    }

    pub fn write_ci_snapshot<T: Serialize>(&self, iter: u32, snapshot: &T) -> Result<()> {
        write_json_atomic(&self.ci_snapshot_path(iter), snapshot)
    }

    pub fn write_config<T: Serialize>(&self, config: &T) -> Result<()> {
        write_json_atomic(&self.config_path(), config)
    }

    /// Append one record as a JSON line; earlier lines are never rewritten.
    pub fn append_iteration(&self, record: &IterationRecord) -> Result<()> {
        let path = self.iterations_path();
        let mut line = serde_json::to_string(record).context("serialize iteration record")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", path.display()))?;
        debug!(iter = record.ordinal, "iteration record appended");
        Ok(())
    }

    pub fn load_iterations(&self) -> Result<Vec<IterationRecord>> {
        let path = self.iterations_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parse {} line {}", path.display(), i + 1))
            })
            .collect()
    }

    pub fn write_result(&self, result: &RunResult) -> Result<()> {
        debug!(run_id = %result.run_id, status = %result.status, "writing run result");
        write_json_atomic(&self.result_path(), result)
    }

    pub fn load_result(&self) -> Result<RunResult> {
        read_json(&self.result_path())
    }
}

/// Keep run artifacts out of commits: `.factory/.gitignore` ignores everything.
pub fn ensure_state_gitignore(workdir: &Path) -> Result<()> {
    let dir = workdir.join(STATE_DIR);
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(".gitignore");
    if path.exists() {
        return Ok(());
    }
    fs::write(&path, "*\n").with_context(|| format!("write {}", path.display()))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Pretty JSON with trailing newline, written via temp file + rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    fs::write(path, text).with_context(|| format!("write {}", path.display()))
}
