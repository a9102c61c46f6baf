mod ci;
mod diff;
mod regress;
mod report;
mod score;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "factory-eval",
    version,
    about = "Scoring and reporting for factory runs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Score a finished run and write `score.json` into its directory.
    Score {
        run_dir: PathBuf,
        /// Base ref for the diff (default: <remote>/<base branch> of the run).
        #[arg(long)]
        base: Option<String>,
    },
    /// Summarise every run under a runs directory.
    Report {
        #[arg(default_value = ".factory/runs")]
        runs_dir: PathBuf,
        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Replay each distinct task through `factory run` and compare with its last run.
    ///
    /// Exits 1 when any replay regressed or could not be run.
    Regress {
        #[arg(default_value = ".factory/runs")]
        runs_dir: PathBuf,
        /// Replay at most this many tasks, oldest first.
        #[arg(long)]
        limit: Option<usize>,
        /// List the tasks that would be replayed without running them.
        #[arg(long)]
        dry_run: bool,
        /// The factory binary to invoke.
        #[arg(long, default_value = "factory")]
        factory: PathBuf,
        /// Per-task limit in minutes.
        #[arg(long = "timeout", value_name = "MINUTES", default_value_t = 120)]
        timeout_minutes: u64,
        /// Print the comparison as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Evaluate the current checkout as a pull request; exits 1 when a check fails.
    Ci {
        #[arg(long, default_value = "origin/main")]
        base: String,
        /// Markdown summary destination (default: $GITHUB_STEP_SUMMARY).
        #[arg(long)]
        summary: Option<PathBuf>,
    },
}

fn main() -> Result<ExitCode> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Score { run_dir, base } => {
            let score = score::score_run_dir(&run_dir, base.as_deref())?;
            println!(
                "{}",
                serde_json::to_string_pretty(&score).context("serialize score")?
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Report { runs_dir, json } => {
            let (summary, warnings) = report::aggregate(&runs_dir)?;
            for warning in &warnings {
                eprintln!("warning: {warning}");
            }
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("serialize report")?
                );
            } else {
                print!("{}", report::render_text(&summary));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Regress {
            runs_dir,
            limit,
            dry_run,
            factory,
            timeout_minutes,
            json,
        } => {
            let (tasks, warnings) = regress::plan(&runs_dir, limit)?;
            for warning in &warnings {
                eprintln!("warning: {warning}");
            }
            if dry_run || tasks.is_empty() {
                print!("{}", regress::render_plan(&tasks));
                return Ok(ExitCode::SUCCESS);
            }
            let replayer = regress::FactoryCommand {
                program: factory,
                timeout: Duration::from_secs(timeout_minutes.saturating_mul(60)),
            };
            let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S").to_string();
            let comparisons = regress::regress(&tasks, &replayer, &stamp);
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&comparisons).context("serialize comparison")?
                );
            } else {
                print!("{}", regress::render_text(&comparisons));
            }
            Ok(if regress::any_regressed(&comparisons) {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Command::Ci { base, summary } => {
            let workdir = std::env::current_dir().context("resolve current directory")?;
            let evaluation = ci::evaluate(&workdir, &base, ci::CommandLimits::default_limits())?;
            let label = match std::env::var("PR_NUMBER") {
                Ok(number) if !number.trim().is_empty() => format!("PR #{}", number.trim()),
                _ => "local checkout".to_string(),
            };
            let markdown = ci::render_summary(&evaluation, &label);
            print!("{markdown}");
            let summary = summary.or_else(|| std::env::var_os("GITHUB_STEP_SUMMARY").map(PathBuf::from));
            if let Some(path) = summary {
                ci::append_summary(&path, &markdown)?;
            }
            Ok(if evaluation.all_passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
