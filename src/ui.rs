use colored::{ColoredString, Colorize};
use declarative::{ExecutorState, RunSummary, StepOutcome};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Plain-text symbol for an outcome
pub fn outcome_glyph(outcome: &StepOutcome) -> &'static str {
    match outcome {
        StepOutcome::Skipped => "○",
        StepOutcome::Applied => "✓",
        StepOutcome::Pending => "●",
        StepOutcome::Failed { .. } => "✗",
        StepOutcome::Undone => "↺",
        StepOutcome::UndoFailed { .. } => "✗",
        StepOutcome::UndoUnsupported => "⊘",
    }
}

/// Colored symbol for an outcome
pub fn outcome_symbol(outcome: &StepOutcome) -> ColoredString {
    let glyph = outcome_glyph(outcome);
    match outcome {
        StepOutcome::Skipped => glyph.dimmed(),
        StepOutcome::Applied => glyph.green(),
        StepOutcome::Pending => glyph.yellow(),
        StepOutcome::Failed { .. } | StepOutcome::UndoFailed { .. } => glyph.red(),
        StepOutcome::Undone => glyph.cyan(),
        StepOutcome::UndoUnsupported => glyph.yellow(),
    }
}

pub fn state_label(state: ExecutorState) -> ColoredString {
    let label = state.to_string();
    match state {
        ExecutorState::Completed => label.green().bold(),
        ExecutorState::Failed => label.red().bold(),
        ExecutorState::RolledBack => label.yellow().bold(),
        ExecutorState::Idle | ExecutorState::Running => label.normal(),
    }
}

/// One-line summary such as `3 applied, 41 skipped`
pub fn summary_line(summary: &RunSummary) -> String {
    let parts: Vec<String> = [
        (summary.applied, "applied"),
        (summary.skipped, "skipped"),
        (summary.pending, "pending"),
        (summary.failed, "failed"),
        (summary.undone, "undone"),
        (summary.undo_failed, "undo failed"),
        (summary.undo_unsupported, "not undoable"),
    ]
    .into_iter()
    .filter(|(count, _)| *count > 0)
    .map(|(count, label)| format!("{} {}", count, label))
    .collect();

    if parts.is_empty() {
        "nothing to do".to_string()
    } else {
        parts.join(", ")
    }
}

/// Truncate a string for display, keeping the end
pub fn truncate_end(text: &str, max_len: usize) -> String {
    let len = text.chars().count();
    if len <= max_len {
        text.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let tail: String = text.chars().skip(len - (max_len - 3)).collect();
        format!("...{}", tail)
    }
}
