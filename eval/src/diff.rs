//! Diff metrics between a base ref and a branch.

use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use factory::core::cancel::CancelToken;
use factory::io::process::run_command_with_timeout;

const GIT_TIMEOUT: Duration = Duration::from_secs(60);
const DIFF_LIMIT_BYTES: usize = 5_000_000;

static FILES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) files? changed").expect("files regex is valid"));
static INSERTIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) insertions?").expect("insertions regex is valid"));
static DELETIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) deletions?").expect("deletions regex is valid"));
static SUPPRESSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\+.*//\s*(ignore|nolint|no-check)").expect("suppression regex is valid")
});
static REMOVED_TEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^-.*(test\(|expect\(|assert)").expect("removed test regex is valid")
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    pub files_changed: u64,
    pub insertions: u64,
    pub deletions: u64,
}

impl DiffStats {
    pub fn changed_lines(&self) -> u64 {
        self.insertions + self.deletions
    }
}

/// Stats plus the full patch text.
#[derive(Debug, Clone, Default)]
pub struct Diff {
    pub stats: DiffStats,
    pub patch: String,
}

/// Parse `git diff --shortstat` output; missing parts count as zero.
pub fn parse_shortstat(raw: &str) -> DiffStats {
    let number = |re: &Regex| {
        re.captures(raw)
            .and_then(|caps| caps[1].parse().ok())
            .unwrap_or(0)
    };
    DiffStats {
        files_changed: number(&FILES_RE),
        insertions: number(&INSERTIONS_RE),
        deletions: number(&DELETIONS_RE),
    }
}

/// `git diff <base>...<head>` in `repo`.
pub fn diff_against(repo: &Path, base: &str, head: &str) -> Result<Diff> {
    let range = format!("{base}...{head}");
    let stats = parse_shortstat(&git(repo, &["diff", "--shortstat", &range])?);
    let patch = git(repo, &["diff", &range])?;
    debug!(range = %range, lines = stats.changed_lines(), "diff computed");
    Ok(Diff { stats, patch })
}

fn git(repo: &Path, args: &[&str]) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(repo);
    let output = run_command_with_timeout(
        cmd,
        None,
        GIT_TIMEOUT,
        DIFF_LIMIT_BYTES,
        &CancelToken::new(),
    )
    .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            output.stderr_lossy().trim()
        );
    }
    Ok(output.stdout_lossy())
}

/// Smaller diffs score higher.
pub fn diff_precision(changed_lines: u64) -> f64 {
    match changed_lines {
        0..=50 => 1.0,
        51..=150 => 0.7,
        151..=500 => 0.4,
        _ => 0.1,
    }
}

/// Penalise patches that game checks instead of fixing them.
///
/// Returns the score and the findings that lowered it.
pub fn integrity(patch: &str) -> (f64, Vec<&'static str>) {
    let mut score = 1.0;
    let mut findings = Vec::new();
    if SUPPRESSION_RE.is_match(patch) {
        score *= 0.3;
        findings.push("adds lint/check suppressions");
    }
    if REMOVED_TEST_RE.is_match(patch) {
        score *= 0.5;
        findings.push("removes tests or assertions");
    }
    (score, findings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_shortstat_variants() {
        assert_eq!(
            parse_shortstat(" 3 files changed, 40 insertions(+), 2 deletions(-)\n"),
            DiffStats {
                files_changed: 3,
                insertions: 40,
                deletions: 2
            }
        );
        let only_insert = parse_shortstat(" 1 file changed, 1 insertion(+)");
        assert_eq!(only_insert.changed_lines(), 1);
        assert_eq!(parse_shortstat(""), DiffStats::default());
    }

    #[test]
    fn precision_buckets() {
        assert_eq!(diff_precision(0), 1.0);
        assert_eq!(diff_precision(50), 1.0);
        assert_eq!(diff_precision(51), 0.7);
        assert_eq!(diff_precision(500), 0.4);
        assert_eq!(diff_precision(501), 0.1);
    }

    #[test]
    fn integrity_penalties_stack() {
        let clean = "+let x = 1;\n-let x = 2;\n";
        assert_eq!(integrity(clean).0, 1.0);

        let suppressed = "+  foo(); // ignore: unused_result\n";
        assert_eq!(integrity(suppressed).0, 0.3);

        let both = "+  foo(); // nolint\n-  expect(widget, findsOneWidget);\n";
        let (score, findings) = integrity(both);
        assert!((score - 0.15).abs() < 1e-9);
        assert_eq!(findings.len(), 2);
    }

    #[test]
    fn context_lines_are_not_penalised() {
        assert_eq!(integrity(" assert_eq!(a, b);\n  // nolint\n").0, 1.0);
        assert_eq!(integrity("+// TODO: handle nolint later\n").0, 1.0);
    }
}
