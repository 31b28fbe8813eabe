//! Human readable rendering of the registry for `prdforge status`

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

use crate::registry::{RegistryDocument, UnitOutcome, UnitRecord};

/// Counts per status bucket
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub active: usize,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
    pub tokens_held: usize,
}

impl StatusSummary {
    pub fn from_document(doc: &RegistryDocument) -> Self {
        Self {
            active: doc.active.len(),
            queued: doc.queued.len(),
            completed: doc.completed.len(),
            failed: doc.failed.len(),
            stopped: doc.stopped.len(),
            tokens_held: doc.active.values().map(|r| r.tokens_held).sum(),
        }
    }
}

pub fn render_status(doc: &RegistryDocument) -> String {
    let summary = StatusSummary::from_document(doc);
    let mut out = String::new();

    let _ = writeln!(
        out,
        "Active {}/{}  Queued {}  Completed {}  Failed {}  Stopped {}  Tokens {}/{}",
        summary.active,
        doc.max_parallel,
        summary.queued,
        summary.completed,
        summary.failed,
        summary.stopped,
        summary.tokens_held,
        doc.api_limit
    );

    if !doc.active.is_empty() {
        let _ = writeln!(out, "\nActive:");
        for record in doc.active.values() {
            let _ = writeln!(out, "  {}", format_active(record));
        }
    }

    if !doc.queued.is_empty() {
        let _ = writeln!(out, "\nQueued:");
        for (position, id) in doc.queued.iter().enumerate() {
            let since = doc
                .queued_at
                .get(id)
                .map(|at| format!(" (since {})", at.format("%Y-%m-%d %H:%M:%S")))
                .unwrap_or_default();
            let _ = writeln!(out, "  {}. {}{}", position + 1, id, since);
        }
    }

    for (title, ids) in [
        ("Completed", &doc.completed),
        ("Failed", &doc.failed),
        ("Stopped", &doc.stopped),
    ] {
        if ids.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\n{title}:");
        for id in ids {
            let line = match doc.outcomes.get(id) {
                Some(outcome) => format_finished(id, outcome),
                None => id.clone(),
            };
            let _ = writeln!(out, "  {line}");
        }
    }

    out
}

fn format_active(record: &UnitRecord) -> String {
    let pid = record
        .worker_pid
        .map(|pid| format!("pid {pid}"))
        .unwrap_or_else(|| "no worker".to_string());
    let running_for = record
        .started_at
        .map(|at| format!(", up {}", format_elapsed((Utc::now() - at).num_seconds())))
        .unwrap_or_default();
    let restarts = if record.restarts > 0 {
        format!(", {} restart(s)", record.restarts)
    } else {
        String::new()
    };

    let mut line = format!(
        "{} [{}] branch {}, {}, {} token(s){}{}",
        record.id, record.status, record.branch, pid, record.tokens_held, running_for, restarts
    );
    if let Some(error) = &record.last_error {
        let _ = write!(line, "\n      last error ({}): {}", error.kind, error.message);
    }
    line
}

fn format_finished(id: &str, outcome: &UnitOutcome) -> String {
    let mut line = format!(
        "{} branch {} at {}",
        id,
        if outcome.branch.is_empty() { "-" } else { &outcome.branch },
        outcome.finished_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(error) = &outcome.error {
        let _ = write!(line, "\n      {}: {}", error.kind, error.message);
    }
    line
}

fn format_elapsed(seconds: i64) -> String {
    let seconds = seconds.max(0);
    match seconds {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m{}s", s / 60, s % 60),
        s => format!("{}h{}m", s / 3600, (s % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::registry::{TerminalStatus, UnitError};

    #[test]
    fn test_render_lists_every_bucket() {
        let mut doc = RegistryDocument::new(2, 2);
        doc.enqueue("auth").unwrap();
        doc.enqueue("billing").unwrap();
        doc.enqueue("search").unwrap();
        doc.register("auth", "feature/auth").unwrap();
        doc.deregister(
            "billing",
            TerminalStatus::Failed,
            Some(UnitError::new(ErrorKind::WorktreeError, "fatal: invalid reference: nope")),
        );

        let rendered = render_status(&doc);
        assert!(rendered.starts_with("Active 1/2  Queued 1  Completed 0  Failed 1"));
        assert!(rendered.contains("auth [starting] branch feature/auth, no worker"));
        assert!(rendered.contains("1. search"));
        assert!(rendered.contains("Failed:\n  billing"));
        assert!(rendered.contains("worktree_error: fatal: invalid reference: nope"));
        assert!(!rendered.contains("Stopped:"));
    }

    #[test]
    fn test_summary_counts_tokens() {
        let mut doc = RegistryDocument::new(3, 2);
        doc.register("a", "a").unwrap();
        doc.register("b", "b").unwrap();
        doc.record_mut("a").unwrap().tokens_held = 1;
        doc.record_mut("b").unwrap().tokens_held = 1;

        let summary = StatusSummary::from_document(&doc);
        assert_eq!(summary.active, 2);
        assert_eq!(summary.tokens_held, 2);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(42), "42s");
        assert_eq!(format_elapsed(125), "2m5s");
        assert_eq!(format_elapsed(7380), "2h3m");
        assert_eq!(format_elapsed(-5), "0s");
    }
}
