//! Progress and cancellation hooks for executor runs
//!
//! These let the executor report to a UI and stop between steps without
//! depending on a specific terminal library or signal handler.

use crate::record::ExecutionRecord;
use crate::types::ExecutorState;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Progress callback for execution operations
///
/// Implement this trait to receive progress updates during a run.
pub trait ProgressCallback: Send {
    /// Called once the plan is ordered, before the first step
    fn on_run_start(&mut self, plan: &str, steps: usize);

    /// Called when starting a single step
    fn on_step_start(&mut self, id: &str, description: &str);

    /// Called with the record of a finished step (including rollback records)
    fn on_step_complete(&mut self, record: &ExecutionRecord);

    /// Called before compensating `count` applied steps
    fn on_rollback_start(&mut self, count: usize);

    /// Called when the run reaches a terminal state
    fn on_run_complete(&mut self, state: ExecutorState);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_run_start(&mut self, _plan: &str, _steps: usize) {}
    fn on_step_start(&mut self, _id: &str, _description: &str) {}
    fn on_step_complete(&mut self, _record: &ExecutionRecord) {}
    fn on_rollback_start(&mut self, _count: usize) {}
    fn on_run_complete(&mut self, _state: ExecutorState) {}
}

/// Cooperative cancellation flag, checked between steps
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the current step finishes first
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Underlying flag, for registration with signal handlers
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}
