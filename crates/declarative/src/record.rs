//! Execution records - the per-run log of what each step did

use crate::error::StepError;
use crate::types::ExecutorState;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// One command issued by a step, with its captured output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTrace {
    pub command: String,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

/// What happened to a step during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum StepOutcome {
    /// Already satisfied, nothing done
    Skipped,
    /// Applied and verified by a second check
    Applied,
    /// Unsatisfied; would be applied (dry run only)
    Pending,
    /// Check, apply or verification failed
    Failed { error: String },
    /// Compensated during rollback
    Undone,
    /// Compensation attempted and failed
    UndoFailed { error: String },
    /// Applied this run but has no compensating action
    UndoUnsupported,
}

impl StepOutcome {
    /// Whether this outcome changed the host
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Applied | Self::Undone)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::UndoFailed { .. })
    }

    /// Whether this outcome was produced by rollback
    pub fn is_rollback(&self) -> bool {
        matches!(self, Self::Undone | Self::UndoFailed { .. } | Self::UndoUnsupported)
    }
}

/// A single entry in the run log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub step: String,
    pub kind: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<CommandTrace>,
}

/// Counts of outcomes in a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub applied: usize,
    pub skipped: usize,
    pub pending: usize,
    pub failed: usize,
    pub undone: usize,
    pub undo_failed: usize,
    pub undo_unsupported: usize,
}

impl RunSummary {
    /// Add an outcome to the summary
    pub fn add_outcome(&mut self, outcome: &StepOutcome) {
        match outcome {
            StepOutcome::Applied => self.applied += 1,
            StepOutcome::Skipped => self.skipped += 1,
            StepOutcome::Pending => self.pending += 1,
            StepOutcome::Failed { .. } => self.failed += 1,
            StepOutcome::Undone => self.undone += 1,
            StepOutcome::UndoFailed { .. } => self.undo_failed += 1,
            StepOutcome::UndoUnsupported => self.undo_unsupported += 1,
        }
    }

    /// Merge another summary into this one
    pub fn merge(&mut self, other: &RunSummary) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.pending += other.pending;
        self.failed += other.failed;
        self.undone += other.undone;
        self.undo_failed += other.undo_failed;
        self.undo_unsupported += other.undo_unsupported;
    }
}

/// Final state of a run plus the ordered records explaining it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub plan: String,
    pub host: String,
    pub state: ExecutorState,
    pub records: Vec<ExecutionRecord>,
    /// The failure that stopped the run
    pub error: Option<StepError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == ExecutorState::Completed
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for record in &self.records {
            summary.add_outcome(&record.outcome);
        }
        summary
    }

    /// Outcomes of non-rollback records, in execution order
    pub fn outcomes(&self) -> Vec<&StepOutcome> {
        self.records
            .iter()
            .map(|r| &r.outcome)
            .filter(|o| !o.is_rollback())
            .collect()
    }

    /// Append one JSON line per record, tagged with host and plan
    pub fn write_jsonl<W: Write>(&self, mut writer: W) -> Result<()> {
        #[derive(Serialize)]
        struct LogLine<'a> {
            host: &'a str,
            plan: &'a str,
            #[serde(flatten)]
            record: &'a ExecutionRecord,
        }

        for record in &self.records {
            let line = LogLine {
                host: &self.host,
                plan: &self.plan,
                record,
            };
            serde_json::to_writer(&mut writer, &line)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}
