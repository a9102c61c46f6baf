//! Run configuration: `factory.toml` defaults, `FACTORY_*` environment and CLI flags.
//!
//! [`resolve`] is pure. The environment is captured once at start-up with
//! [`env_snapshot`] and passed in as a map, so nothing reads ambient state
//! after the run begins.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::naming;

pub const CONFIG_FILE: &str = "factory.toml";
/// Directory (relative to the workdir) that holds run artifacts; never committed.
pub const STATE_DIR: &str = ".factory";

pub const ENV_MAX_ITERATIONS: &str = "FACTORY_MAX_ITERATIONS";
pub const ENV_MAX_COST_USD: &str = "FACTORY_MAX_COST_USD";
pub const ENV_MODEL: &str = "FACTORY_MODEL";
pub const ENV_CI_TIMEOUT_MINUTES: &str = "FACTORY_CI_TIMEOUT_MINUTES";
pub const ENV_CHECKS: &str = "FACTORY_CHECKS";
pub const ENV_CHECK_SCRIPT: &str = "FACTORY_CHECK_SCRIPT";
pub const ENV_NOTIFY: &str = "FACTORY_NOTIFY";
pub const ENV_BASE_BRANCH: &str = "FACTORY_BASE_BRANCH";

/// Upper bound for the CI wait (one week).
pub const MAX_CI_TIMEOUT_MINUTES: u64 = 7 * 24 * 60;

/// Defaults file (TOML).
///
/// Missing fields default to the built-in values, so an empty or absent file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FactoryConfig {
    pub model: String,
    pub max_iterations: u32,
    /// Spend ceiling handed to every agent invocation.
    pub max_cost_usd: f64,
    /// 0 disables waiting for CI.
    pub ci_timeout_minutes: u64,
    pub ci_poll_interval_secs: u64,
    pub checks: Vec<String>,
    /// Replaces `checks` when set.
    pub check_script: Option<PathBuf>,
    pub check_timeout_secs: u64,
    pub check_output_limit_bytes: usize,
    pub base_branch: Option<String>,
    pub remote: String,
    /// Relative to the workdir unless absolute.
    pub runs_dir: PathBuf,
    /// Shell command that receives notifications on stdin.
    pub notify: Option<String>,
    pub agent: AgentConfig,
    pub evaluator: EvaluatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Program and leading arguments; model and budget flags are appended.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string()],
            timeout_secs: 60 * 60,
            output_limit_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub enabled: bool,
    /// The run directory is appended as the last argument.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: vec!["factory-eval".to_string(), "score".to_string()],
            timeout_secs: 10 * 60,
        }
    }
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            model: "sonnet".to_string(),
            max_iterations: 5,
            max_cost_usd: 5.0,
            ci_timeout_minutes: 20,
            ci_poll_interval_secs: 30,
            checks: vec!["analyze".to_string(), "unitTest".to_string()],
            check_script: None,
            check_timeout_secs: 30 * 60,
            check_output_limit_bytes: 100_000,
            base_branch: None,
            remote: "origin".to_string(),
            runs_dir: PathBuf::from(STATE_DIR).join("runs"),
            notify: None,
            agent: AgentConfig::default(),
            evaluator: EvaluatorConfig::default(),
        }
    }
}

impl FactoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must be non-empty"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be >= 1"));
        }
        validate_cost(self.max_cost_usd)?;
        ci_timeout(self.ci_timeout_minutes)?;
        if self.ci_poll_interval_secs == 0 {
            return Err(anyhow!("ci_poll_interval_secs must be > 0"));
        }
        if self.check_timeout_secs == 0 {
            return Err(anyhow!("check_timeout_secs must be > 0"));
        }
        if self.check_output_limit_bytes == 0 {
            return Err(anyhow!("check_output_limit_bytes must be > 0"));
        }
        if self.remote.trim().is_empty() {
            return Err(anyhow!("remote must be non-empty"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 || self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent timeout and output limit must be > 0"));
        }
        if self.evaluator.enabled
            && (self.evaluator.command.is_empty() || self.evaluator.command[0].trim().is_empty())
        {
            return Err(anyhow!("evaluator.command must be a non-empty array"));
        }
        Ok(())
    }
}

/// Convert the CI wait to a `Duration`, rejecting values beyond the cap.
fn ci_timeout(minutes: u64) -> Result<Duration> {
    if minutes > MAX_CI_TIMEOUT_MINUTES {
        bail!("ci timeout must be at most {MAX_CI_TIMEOUT_MINUTES} minutes, got {minutes}");
    }
    let secs = minutes
        .checked_mul(60)
        .ok_or_else(|| anyhow!("ci timeout of {minutes} minutes overflows"))?;
    Ok(Duration::from_secs(secs))
}

fn validate_cost(cost: f64) -> Result<()> {
    if !cost.is_finite() || cost <= 0.0 {
        return Err(anyhow!("max cost must be a positive number of USD, got {cost}"));
    }
    Ok(())
}

/// Load defaults from a TOML file; a missing file yields the built-in defaults.
pub fn load_config(path: &Path) -> Result<FactoryConfig> {
    if !path.exists() {
        let cfg = FactoryConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FactoryConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Capture the `FACTORY_*` variables once.
pub fn env_snapshot() -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| key.starts_with("FACTORY_"))
        .collect()
}

/// Overrides given on the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunFlags {
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    pub max_iterations: Option<u32>,
    pub max_cost_usd: Option<f64>,
    pub model: Option<String>,
    pub checks: Option<Vec<String>>,
    pub check_script: Option<PathBuf>,
    pub ci_timeout_minutes: Option<u64>,
    pub skip_ci: bool,
    pub notify: Option<String>,
}

/// The task a run works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInput {
    pub text: String,
    pub workdir: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// How local verification is performed; exactly one mode is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum Verification {
    Checks(Vec<String>),
    Script(PathBuf),
}

/// Immutable configuration for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    pub run_id: String,
    pub task_title: String,
    pub task_text: String,
    pub branch: String,
    pub base_branch: Option<String>,
    pub remote: String,
    pub model: String,
    pub max_iterations: u32,
    pub max_cost_usd: f64,
    pub ci_timeout: Duration,
    pub skip_ci: bool,
    pub ci_poll_interval: Duration,
    pub verification: Verification,
    pub check_timeout: Duration,
    pub check_output_limit_bytes: usize,
    pub notify: Option<String>,
    pub workdir: PathBuf,
    pub run_dir: PathBuf,
    pub agent_command: Vec<String>,
    pub agent_timeout: Duration,
    pub agent_output_limit_bytes: usize,
    pub evaluator_command: Option<Vec<String>>,
    pub evaluator_timeout: Duration,
    pub started_at: DateTime<Utc>,
}

impl RunConfig {
    /// CI is awaited unless skipped or given a zero timeout.
    pub fn ci_wait_enabled(&self) -> bool {
        !self.skip_ci && !self.ci_timeout.is_zero()
    }
}

/// Merge defaults, environment and flags (later wins) into a [`RunConfig`].
pub fn resolve(
    file: &FactoryConfig,
    env: &BTreeMap<String, String>,
    flags: &RunFlags,
    task: TaskInput,
) -> Result<RunConfig> {
    file.validate()?;
    if task.text.trim().is_empty() {
        bail!("task description is empty");
    }

    let max_iterations = match flags.max_iterations {
        Some(n) => n,
        None => env_parse(env, ENV_MAX_ITERATIONS)?.unwrap_or(file.max_iterations),
    };
    if max_iterations == 0 {
        bail!("max iterations must be >= 1");
    }

    let max_cost_usd = match flags.max_cost_usd {
        Some(c) => c,
        None => env_parse(env, ENV_MAX_COST_USD)?.unwrap_or(file.max_cost_usd),
    };
    validate_cost(max_cost_usd)?;

    let ci_timeout_minutes = match flags.ci_timeout_minutes {
        Some(m) => m,
        None => env_parse(env, ENV_CI_TIMEOUT_MINUTES)?.unwrap_or(file.ci_timeout_minutes),
    };
    let ci_timeout = ci_timeout(ci_timeout_minutes)?;

    let model = flags
        .model
        .clone()
        .or_else(|| env_string(env, ENV_MODEL))
        .unwrap_or_else(|| file.model.clone());
    if model.trim().is_empty() {
        bail!("model must be non-empty");
    }

    let verification = resolve_verification(file, env, flags)?;

    let notify = flags
        .notify
        .clone()
        .or_else(|| env_string(env, ENV_NOTIFY))
        .or_else(|| file.notify.clone());
    let base_branch = flags
        .base_branch
        .clone()
        .or_else(|| env_string(env, ENV_BASE_BRANCH))
        .or_else(|| file.base_branch.clone());

    let task_title = naming::task_title(&task.text);
    let run_id = naming::run_id(task.started_at, &task_title);
    let branch = match &flags.branch {
        Some(b) if b.trim().is_empty() => bail!("branch name must be non-empty"),
        Some(b) => b.trim().to_string(),
        None => naming::default_branch(&run_id),
    };
    let runs_dir = if file.runs_dir.is_absolute() {
        file.runs_dir.clone()
    } else {
        task.workdir.join(&file.runs_dir)
    };

    Ok(RunConfig {
        run_dir: runs_dir.join(&run_id),
        run_id,
        task_title,
        task_text: task.text,
        branch,
        base_branch,
        remote: file.remote.clone(),
        model,
        max_iterations,
        max_cost_usd,
        ci_timeout,
        skip_ci: flags.skip_ci,
        ci_poll_interval: Duration::from_secs(file.ci_poll_interval_secs),
        verification,
        check_timeout: Duration::from_secs(file.check_timeout_secs),
        check_output_limit_bytes: file.check_output_limit_bytes,
        notify,
        workdir: task.workdir,
        agent_command: file.agent.command.clone(),
        agent_timeout: Duration::from_secs(file.agent.timeout_secs),
        agent_output_limit_bytes: file.agent.output_limit_bytes,
        evaluator_command: file
            .evaluator
            .enabled
            .then(|| file.evaluator.command.clone()),
        evaluator_timeout: Duration::from_secs(file.evaluator.timeout_secs),
        started_at: task.started_at,
    })
}

/// The highest layer that configures verification decides it; a layer may not set both modes.
fn resolve_verification(
    file: &FactoryConfig,
    env: &BTreeMap<String, String>,
    flags: &RunFlags,
) -> Result<Verification> {
    let layers = [
        ("flags", flags.checks.clone(), flags.check_script.clone()),
        (
            "environment",
            env_string(env, ENV_CHECKS).map(|raw| split_checks(&raw)),
            env_string(env, ENV_CHECK_SCRIPT).map(PathBuf::from),
        ),
        ("config", Some(file.checks.clone()), file.check_script.clone()),
    ];
    for (layer, checks, script) in layers {
        match (checks, script) {
            (Some(_), Some(_)) if layer != "config" => {
                bail!("{layer} set both a check list and a check script; choose one")
            }
            (_, Some(script)) => return Ok(Verification::Script(script)),
            (Some(checks), None) => {
                if checks.is_empty() {
                    bail!("{layer} configured an empty check list");
                }
                return Ok(Verification::Checks(checks));
            }
            (None, None) => {}
        }
    }
    Err(anyhow!("no local verification configured"))
}

fn split_checks(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_string(env: &BTreeMap<String, String>, key: &str) -> Option<String> {
    env.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(env: &BTreeMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(env, key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("invalid {key}={raw}: {e}")),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn task() -> TaskInput {
        TaskInput {
            text: "# Add login button\n\nDetails.".to_string(),
            workdir: PathBuf::from("/work/app"),
            started_at: Utc
                .with_ymd_and_hms(2026, 1, 2, 3, 4, 5)
                .single()
                .expect("time"),
        }
    }

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, FactoryConfig::default());
    }

    #[test]
    fn load_partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        fs::write(
            &path,
            "model = \"opus\"\nchecks = [\"noop\"]\n[agent]\ntimeout_secs = 60\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.model, "opus");
        assert_eq!(cfg.checks, vec!["noop".to_string()]);
        assert_eq!(cfg.agent.timeout_secs, 60);
        assert_eq!(cfg.agent.command, vec!["claude".to_string()]);
        assert_eq!(cfg.max_iterations, 5);
    }

    #[test]
    fn load_rejects_zero_iterations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        fs::write(&path, "max_iterations = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("max_iterations"));
    }

    #[test]
    fn defaults_produce_named_branch_and_run_dir() {
        let cfg = resolve(
            &FactoryConfig::default(),
            &BTreeMap::new(),
            &RunFlags::default(),
            task(),
        )
        .expect("resolve");
        assert_eq!(cfg.run_id, "20260102-030405-add-login-button");
        assert_eq!(cfg.branch, "agent/20260102-030405-add-login-button");
        assert_eq!(
            cfg.run_dir,
            PathBuf::from("/work/app/.factory/runs/20260102-030405-add-login-button")
        );
        assert_eq!(cfg.task_title, "Add login button");
        assert_eq!(cfg.ci_timeout, Duration::from_secs(20 * 60));
        assert!(cfg.ci_wait_enabled());
        assert_eq!(
            cfg.verification,
            Verification::Checks(vec!["analyze".to_string(), "unitTest".to_string()])
        );
    }

    #[test]
    fn flags_override_env_override_file() {
        let file = FactoryConfig {
            max_iterations: 2,
            model: "haiku".to_string(),
            ..FactoryConfig::default()
        };
        let env = env(&[(ENV_MAX_ITERATIONS, "4"), (ENV_MODEL, "opus")]);
        let flags = RunFlags {
            max_iterations: Some(7),
            ..RunFlags::default()
        };
        let cfg = resolve(&file, &env, &flags, task()).expect("resolve");
        assert_eq!(cfg.max_iterations, 7);
        assert_eq!(cfg.model, "opus");
    }

    #[test]
    fn invalid_env_value_is_a_usage_error() {
        let env = env(&[(ENV_MAX_COST_USD, "lots")]);
        let err = resolve(
            &FactoryConfig::default(),
            &env,
            &RunFlags::default(),
            task(),
        )
        .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_COST_USD));
    }

    #[test]
    fn rejects_non_positive_budgets() {
        let flags = RunFlags {
            max_cost_usd: Some(0.0),
            ..RunFlags::default()
        };
        assert!(resolve(&FactoryConfig::default(), &BTreeMap::new(), &flags, task()).is_err());
        let flags = RunFlags {
            max_iterations: Some(0),
            ..RunFlags::default()
        };
        assert!(resolve(&FactoryConfig::default(), &BTreeMap::new(), &flags, task()).is_err());
    }

    #[test]
    fn zero_ci_timeout_or_skip_disables_wait() {
        let flags = RunFlags {
            ci_timeout_minutes: Some(0),
            ..RunFlags::default()
        };
        let cfg = resolve(&FactoryConfig::default(), &BTreeMap::new(), &flags, task())
            .expect("resolve");
        assert!(!cfg.ci_wait_enabled());

        let flags = RunFlags {
            skip_ci: true,
            ..RunFlags::default()
        };
        let cfg = resolve(&FactoryConfig::default(), &BTreeMap::new(), &flags, task())
            .expect("resolve");
        assert!(!cfg.ci_wait_enabled());
    }

    #[test]
    fn oversized_ci_timeout_is_rejected() {
        let flags = RunFlags {
            ci_timeout_minutes: Some(u64::MAX / 10),
            ..RunFlags::default()
        };
        let err = resolve(&FactoryConfig::default(), &BTreeMap::new(), &flags, task())
            .unwrap_err();
        assert!(err.to_string().contains("ci timeout"));

        let env = env(&[(ENV_CI_TIMEOUT_MINUTES, "18446744073709551615")]);
        assert!(resolve(&FactoryConfig::default(), &env, &RunFlags::default(), task()).is_err());

        let flags = RunFlags {
            ci_timeout_minutes: Some(MAX_CI_TIMEOUT_MINUTES),
            ..RunFlags::default()
        };
        let cfg = resolve(&FactoryConfig::default(), &BTreeMap::new(), &flags, task())
            .expect("resolve");
        assert_eq!(cfg.ci_timeout, Duration::from_secs(MAX_CI_TIMEOUT_MINUTES * 60));

        let file = FactoryConfig {
            ci_timeout_minutes: MAX_CI_TIMEOUT_MINUTES + 1,
            ..FactoryConfig::default()
        };
        assert!(file.validate().is_err());
    }

    #[test]
    fn script_in_higher_layer_replaces_checks() {
        let env = env(&[(ENV_CHECK_SCRIPT, "./verify.sh")]);
        let cfg = resolve(
            &FactoryConfig::default(),
            &env,
            &RunFlags::default(),
            task(),
        )
        .expect("resolve");
        assert_eq!(
            cfg.verification,
            Verification::Script(PathBuf::from("./verify.sh"))
        );

        let flags = RunFlags {
            checks: Some(vec!["noop".to_string()]),
            ..RunFlags::default()
        };
        let cfg = resolve(&FactoryConfig::default(), &env, &flags, task()).expect("resolve");
        assert_eq!(
            cfg.verification,
            Verification::Checks(vec!["noop".to_string()])
        );
    }

    #[test]
    fn both_modes_in_one_layer_is_rejected() {
        let flags = RunFlags {
            checks: Some(vec!["noop".to_string()]),
            check_script: Some(PathBuf::from("verify.sh")),
            ..RunFlags::default()
        };
        let err = resolve(&FactoryConfig::default(), &BTreeMap::new(), &flags, task())
            .unwrap_err();
        assert!(err.to_string().contains("choose one"));
    }

    #[test]
    fn env_check_list_is_comma_separated() {
        let env = env(&[(ENV_CHECKS, "analyze, npm run e2e ,")]);
        let cfg = resolve(
            &FactoryConfig::default(),
            &env,
            &RunFlags::default(),
            task(),
        )
        .expect("resolve");
        assert_eq!(
            cfg.verification,
            Verification::Checks(vec!["analyze".to_string(), "npm run e2e".to_string()])
        );
    }

    #[test]
    fn empty_task_is_rejected() {
        let mut input = task();
        input.text = "  \n".to_string();
        assert!(
            resolve(
                &FactoryConfig::default(),
                &BTreeMap::new(),
                &RunFlags::default(),
                input
            )
            .is_err()
        );
    }
}
