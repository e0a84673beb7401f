//! Terminal display helpers: colors, truncation, the status table.

use std::io::{stdout, IsTerminal};

use ralph_core::{SessionRecord, SessionStatus};

/// Color helpers honoring a global use-colors decision.
pub mod colors {
    pub fn paint(s: &str, code: &str, enabled: bool) -> String {
        if enabled {
            format!("\x1b[{code}m{s}\x1b[0m")
        } else {
            s.to_string()
        }
    }

    pub fn green(s: &str, enabled: bool) -> String {
        paint(s, "32", enabled)
    }

    pub fn yellow(s: &str, enabled: bool) -> String {
        paint(s, "33", enabled)
    }

    pub fn red(s: &str, enabled: bool) -> String {
        paint(s, "31", enabled)
    }

    pub fn dim(s: &str, enabled: bool) -> String {
        paint(s, "2", enabled)
    }
}

/// Whether stdout wants colors.
pub fn use_colors() -> bool {
    stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

/// Truncate to `max` chars with an ellipsis.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}\u{2026}")
}

fn status_cell(status: SessionStatus, reason: &str, colored: bool) -> String {
    let text = if reason.is_empty() {
        status.as_str().to_string()
    } else {
        format!("{} ({reason})", status.as_str())
    };
    match status {
        SessionStatus::Running => colors::green(&text, colored),
        SessionStatus::Completed => colors::green(&text, colored),
        SessionStatus::Checkpointed => colors::yellow(&text, colored),
        SessionStatus::Stopped => colors::yellow(&text, colored),
        SessionStatus::Failed => colors::red(&text, colored),
    }
}

/// Render the `ralph status` table.
pub fn status_table(records: &[SessionRecord], colored: bool) -> String {
    if records.is_empty() {
        return "No sessions found.".to_string();
    }

    let mut lines = Vec::new();
    lines.push(format!(
        "{:<25} {:<26} {:<10} {:<8} {}",
        "Task", "Status", "Agent", "Iter", "Task dir"
    ));
    lines.push("-".repeat(88));
    for r in records {
        let iter = format!("{}/{}", r.last_iteration, r.max_iterations);
        lines.push(format!(
            "{:<25} {:<26} {:<10} {:<8} {}",
            truncate(&r.task_name, 24),
            status_cell(r.status, &r.status_reason, colored),
            r.agent,
            iter,
            truncate(&r.task_dir.display().to_string(), 40),
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn truncate_short_strings_untouched() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("exactly-10", 10), "exactly-10");
    }

    #[test]
    fn truncate_adds_ellipsis() {
        let out = truncate("a-very-long-task-name", 10);
        assert_eq!(out.chars().count(), 10);
        assert!(out.ends_with('\u{2026}'));
    }

    #[test]
    fn table_includes_reason() {
        let mut r = SessionRecord::new("demo", Path::new("tasks/demo"), "claude", 10);
        r.status = SessionStatus::Failed;
        r.status_reason = "agents_exhausted".into();
        let table = status_table(&[r], false);
        assert!(table.contains("failed (agents_exhausted)"));
        assert!(table.contains("0/10"));
    }

    #[test]
    fn empty_table_message() {
        assert_eq!(status_table(&[], false), "No sessions found.");
    }
}
