//! `factory`: drive a code-generation agent until its change passes local checks and CI.
//!
//! Run artifacts live under `.factory/runs/<run-id>/`. The last stdout line is
//! the terminal status (`success`, `failed`, `ci_timeout` or `cancelled`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use factory::core::cancel::CancelToken;
use factory::core::types::RunStatus;
use factory::exit_codes;
use factory::io::agent::ClaudeAgent;
use factory::io::checks::LocalVerifier;
use factory::io::clock::SystemClock;
use factory::io::config::{
    CONFIG_FILE, RunConfig, RunFlags, STATE_DIR, TaskInput, Verification, env_snapshot,
    load_config, resolve,
};
use factory::io::evaluate::{CommandEvaluator, Evaluator};
use factory::io::git::Git;
use factory::io::hosting::GhHosting;
use factory::io::notify::{CommandNotifier, LogNotifier, Notifier};
use factory::io::run_dir::ensure_state_gitignore;
use factory::logging;
use factory::run::{Collaborators, execute};

#[derive(Parser)]
#[command(
    name = "factory",
    version,
    about = "Autonomous build-fix-verify controller"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Iterate on a task until local checks and CI pass, or the budget runs out.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Markdown file describing the task.
    task_file: PathBuf,
    /// Branch to push to (default: agent/<run-id>).
    #[arg(long)]
    branch: Option<String>,
    /// Base branch for the change request.
    #[arg(long = "base")]
    base_branch: Option<String>,
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Spend ceiling per agent invocation, in USD.
    #[arg(long = "max-cost")]
    max_cost_usd: Option<f64>,
    #[arg(long)]
    model: Option<String>,
    /// Comma-separated check names (analyze, unitTest, genericTest, noop).
    #[arg(long, value_delimiter = ',', conflicts_with = "check_script")]
    checks: Option<Vec<String>>,
    /// Shell script that replaces the named checks.
    #[arg(long)]
    check_script: Option<PathBuf>,
    /// Minutes to wait for CI; 0 disables the wait.
    #[arg(long = "ci-timeout", value_name = "MINUTES")]
    ci_timeout_minutes: Option<u64>,
    /// Treat a passing local verification as final.
    #[arg(long)]
    skip_ci: bool,
    /// Shell command that receives the run summary on stdin.
    #[arg(long)]
    notify: Option<String>,
    /// Config file (default: <workdir>/factory.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Repository to work in (default: current directory).
    #[arg(long)]
    workdir: Option<PathBuf>,
}

impl RunArgs {
    fn flags(&self) -> RunFlags {
        RunFlags {
            branch: self.branch.clone(),
            base_branch: self.base_branch.clone(),
            max_iterations: self.max_iterations,
            max_cost_usd: self.max_cost_usd,
            model: self.model.clone(),
            checks: self.checks.clone(),
            check_script: self.check_script.clone(),
            ci_timeout_minutes: self.ci_timeout_minutes,
            skip_ci: self.skip_ci,
            notify: self.notify.clone(),
        }
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run(args) => match cmd_run(&args) {
            Ok(status) => {
                println!("{status}");
                if status == RunStatus::Cancelled {
                    exit_codes::CANCELLED
                } else {
                    exit_codes::OK
                }
            }
            Err(err) => {
                error!("{err:#}");
                eprintln!("{err:#}");
                exit_codes::INVALID
            }
        },
    };
    std::process::exit(code);
}

fn cmd_run(args: &RunArgs) -> Result<RunStatus> {
    let workdir = match &args.workdir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let workdir = workdir
        .canonicalize()
        .with_context(|| format!("resolve workdir {}", workdir.display()))?;
    let task_text = fs::read_to_string(&args.task_file)
        .with_context(|| format!("read task file {}", args.task_file.display()))?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| workdir.join(CONFIG_FILE));
    let file = load_config(&config_path)?;
    let config = resolve(
        &file,
        &env_snapshot(),
        &args.flags(),
        TaskInput {
            text: task_text,
            workdir,
            started_at: Utc::now(),
        },
    )?;
    preflight(&config)?;

    let cancel = CancelToken::new();
    spawn_interrupt_listener(cancel.clone())?;

    let host = GhHosting::new(
        Git::new(&config.workdir),
        config.remote.clone(),
        config.base_branch.clone(),
        cancel.clone(),
    );
    let agent = ClaudeAgent::new(config.agent_command.clone(), cancel.clone());
    let verifier = LocalVerifier::new(config.verification.clone(), cancel.clone());
    let evaluator = config
        .evaluator_command
        .clone()
        .map(|command| CommandEvaluator::new(command, config.evaluator_timeout, cancel.clone()));
    // Notification also runs for cancelled runs, so it gets its own token.
    let notifier: Box<dyn Notifier> = match &config.notify {
        Some(target) => Box::new(CommandNotifier::new(target.clone(), CancelToken::new())),
        None => Box::new(LogNotifier),
    };

    let parts = Collaborators {
        agent: &agent,
        verifier: &verifier,
        host: &host,
        clock: &SystemClock,
        evaluator: evaluator.as_ref().map(|e| e as &dyn Evaluator),
        notifier: notifier.as_ref(),
    };
    let result = execute(&config, &parts, &cancel)?;
    info!(
        status = %result.status,
        iterations = result.iterations_used,
        result = %config.run_dir.join("result.json").display(),
        "run recorded"
    );
    Ok(result.status)
}

/// Refuse to start unless the workdir is a git checkout with no foreign changes.
fn preflight(config: &RunConfig) -> Result<()> {
    let git = Git::new(&config.workdir);
    git.current_branch()
        .with_context(|| format!("{} is not a usable git checkout", config.workdir.display()))?;
    ensure_state_gitignore(&config.workdir)?;
    let state_prefix = format!("{STATE_DIR}/");
    git.ensure_clean_except_prefixes(&[state_prefix.as_str()])?;
    if let Verification::Script(script) = &config.verification {
        check_script_exists(&config.workdir, script)?;
    }
    Ok(())
}

fn check_script_exists(workdir: &Path, script: &Path) -> Result<()> {
    let path = workdir.join(script);
    if !path.is_file() {
        bail!("check script {} does not exist", path.display());
    }
    Ok(())
}

/// First Ctrl-C cancels the run cooperatively; a second one exits at once.
fn spawn_interrupt_listener(cancel: CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    std::thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(err = %err, "cannot listen for Ctrl-C");
                    return;
                }
                warn!("interrupt received; cancelling run (Ctrl-C again to exit immediately)");
                cancel.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(exit_codes::CANCELLED);
                }
            });
        })
        .context("spawn interrupt listener")?;
    Ok(())
}
