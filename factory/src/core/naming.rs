//! Run identifiers, branch names and task titles.

use chrono::{DateTime, Utc};

/// Lowercase ASCII slug, dash separated, at most `max_len` bytes.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// First markdown line of a task, stripped of heading markers.
pub fn task_title(task_text: &str) -> String {
    task_text
        .lines()
        .map(|line| line.trim().trim_start_matches('#').trim())
        .find(|line| !line.is_empty())
        .unwrap_or("task")
        .to_string()
}

/// `YYYYMMDD-HHMMSS-<slug>`; sortable by start time.
pub fn run_id(started_at: DateTime<Utc>, title: &str) -> String {
    let slug = slugify(title, 40);
    let stamp = started_at.format("%Y%m%d-%H%M%S");
    if slug.is_empty() {
        format!("{stamp}-task")
    } else {
        format!("{stamp}-{slug}")
    }
}

pub fn default_branch(run_id: &str) -> String {
    format!("agent/{run_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("Fix: login -- crash!", 40), "fix-login-crash");
        assert_eq!(slugify("Ünïcode Title", 40), "n-code-title");
        assert_eq!(slugify("a very long title here", 6), "a-very");
        assert_eq!(slugify("abc def", 4), "abc");
    }

    #[test]
    fn task_title_uses_first_non_empty_line() {
        assert_eq!(task_title("\n# Add dark mode\n\nDetails"), "Add dark mode");
        assert_eq!(task_title(""), "task");
    }

    #[test]
    fn run_id_and_branch_are_stable() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single().expect("time");
        let id = run_id(at, "Add dark mode");
        assert_eq!(id, "20260304-050607-add-dark-mode");
        assert_eq!(default_branch(&id), "agent/20260304-050607-add-dark-mode");
        assert_eq!(run_id(at, "!!!"), "20260304-050607-task");
    }
}
