//! Progress bars for provisioning runs, one per host

use crate::ui;
use declarative::{ExecutionRecord, ExecutorState, ProgressCallback};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

const BAR_TEMPLATE: &str = "{spinner:.green} {prefix:.bold} [{bar:30.cyan/blue}] {pos}/{len} {msg}";

const MESSAGE_WIDTH: usize = 48;

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

/// Reports one host's run to its own bar.
///
/// Changes and failures are printed above the bars; skipped steps only
/// advance the bar.
pub struct HostProgress {
    host: String,
    bar: ProgressBar,
}

impl HostProgress {
    pub fn new(multi: &MultiProgress, host: &str) -> Self {
        let bar = multi.add(ProgressBar::new(0));
        bar.set_style(bar_style());
        bar.set_prefix(host.to_string());
        Self {
            host: host.to_string(),
            bar,
        }
    }

    /// Progress that draws nothing, for `--quiet`
    pub fn hidden(host: &str) -> Self {
        Self {
            host: host.to_string(),
            bar: ProgressBar::hidden(),
        }
    }

    /// Mark the host as failed before a run could start
    pub fn abandon(&self, reason: &str) {
        self.bar.abandon_with_message(ui::truncate_end(reason, MESSAGE_WIDTH));
    }
}

impl ProgressCallback for HostProgress {
    fn on_run_start(&mut self, plan: &str, steps: usize) {
        self.bar.set_length(steps as u64);
        self.bar.set_message(format!("{} ({} steps)", plan, steps));
    }

    fn on_step_start(&mut self, id: &str, _description: &str) {
        self.bar.set_message(ui::truncate_end(id, MESSAGE_WIDTH));
    }

    fn on_step_complete(&mut self, record: &ExecutionRecord) {
        if !record.outcome.is_rollback() {
            self.bar.inc(1);
        }
        if record.outcome.is_change() || record.outcome.is_failure() || record.outcome.is_rollback()
        {
            self.bar.println(format!(
                "  {} {} {}",
                ui::outcome_symbol(&record.outcome),
                self.host,
                record.step
            ));
        }
    }

    fn on_rollback_start(&mut self, count: usize) {
        self.bar
            .set_message(format!("rolling back {} step(s)", count));
    }

    fn on_run_complete(&mut self, state: ExecutorState) {
        let label = ui::state_label(state).to_string();
        match state {
            ExecutorState::Completed => self.bar.finish_with_message(label),
            _ => self.bar.abandon_with_message(label),
        }
    }
}
