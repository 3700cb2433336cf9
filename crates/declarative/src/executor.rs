//! Execution engine - applies a plan step by step over one session
//!
//! State machine: `Idle -> Running -> {Completed, Failed, RolledBack}`.
//! Each step is checked, applied when unsatisfied, then checked again.
//! A failure compensates every step applied in this run, newest first.

use crate::context::{CancelToken, NoProgress, ProgressCallback};
use crate::error::{PlanError, StepError, is_transfer};
use crate::plan::Plan;
use crate::record::{ExecutionRecord, RunReport, StepOutcome};
use crate::retry::{LogCallback, with_retry};
use crate::session::{RecordingSession, Session, SessionGuard};
use crate::step::{SharedStep, Step};
use crate::types::{ExecuteOptions, ExecutorState};
use anyhow::Result;
use chrono::Utc;
use std::time::Instant;

/// Drives plans against sessions
pub struct Executor {
    opts: ExecuteOptions,
    cancel: CancelToken,
    state: ExecutorState,
}

/// Result of converging a single step
enum Converged {
    Skipped,
    Applied,
}

/// Why a step stopped the run, and whether its apply had already succeeded
struct Halt {
    error: StepError,
    applied: bool,
}

impl Executor {
    pub fn new(opts: ExecuteOptions) -> Self {
        Self {
            opts,
            cancel: CancelToken::new(),
            state: ExecutorState::Idle,
        }
    }

    /// Use an externally owned cancellation token
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// State of the most recent run
    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Apply `plan` over `session`.
    ///
    /// The session is owned for the duration of the run and closed on every
    /// exit path. Plan errors are returned before any remote command runs;
    /// step failures are reported through the returned [`RunReport`].
    pub fn execute<S, P>(
        &mut self,
        plan: &Plan,
        session: S,
        progress: &mut P,
    ) -> Result<RunReport, PlanError>
    where
        S: Session,
        P: ProgressCallback,
    {
        self.state = ExecutorState::Idle;
        let mut guard = SessionGuard::new(session);
        let order = plan.topological_order()?;
        let session: &mut dyn Session = &mut *guard;

        let started_at = Utc::now();
        let host = session.host().to_string();
        self.state = ExecutorState::Running;
        log::info!("[{}] running plan {} ({} steps)", host, plan.name(), order.len());
        progress.on_run_start(plan.name(), order.len());

        let mut records = Vec::with_capacity(order.len());
        let mut applied: Vec<SharedStep> = Vec::new();
        let mut failure = None;

        for (position, step) in order.iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::warn!("[{}] cancelled after {} step(s)", host, position);
                failure = Some(StepError::Cancelled {
                    completed: position,
                });
                break;
            }

            progress.on_step_start(step.id(), &step.description());
            let started = Instant::now();
            let timestamp = Utc::now();
            let mut recording = RecordingSession::new(&mut *session);
            let result = self.converge(step.as_ref(), &mut recording);
            let output = recording.into_traces();

            let outcome = match result {
                Ok(Converged::Skipped) => StepOutcome::Skipped,
                Ok(Converged::Applied) => {
                    applied.push(SharedStep::clone(step));
                    StepOutcome::Applied
                }
                Err(halt) => {
                    if halt.applied {
                        applied.push(SharedStep::clone(step));
                    }
                    let outcome = StepOutcome::Failed {
                        error: halt.error.to_string(),
                    };
                    failure = Some(halt.error);
                    outcome
                }
            };

            log::debug!("[{}] {} -> {:?}", host, step.id(), outcome);
            let record = ExecutionRecord {
                step: step.id().to_string(),
                kind: step.kind().to_string(),
                outcome,
                timestamp,
                duration_ms: started.elapsed().as_millis() as u64,
                output,
            };
            progress.on_step_complete(&record);
            records.push(record);

            if failure.is_some() {
                break;
            }
        }

        if let Some(error) = &failure {
            self.state = ExecutorState::Failed;
            log::error!("[{}] {}", host, error);

            if error.triggers_rollback() {
                self.rollback(&applied, session, progress, &mut records);
                self.state = ExecutorState::RolledBack;
            }
        } else {
            self.state = ExecutorState::Completed;
            self.finish(&applied, session);
        }

        log::info!("[{}] plan {} {}", host, plan.name(), self.state);
        progress.on_run_complete(self.state);

        Ok(RunReport {
            plan: plan.name().to_string(),
            host,
            state: self.state,
            records,
            error: failure,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Check every step without applying anything.
    ///
    /// Unsatisfied steps are recorded as [`StepOutcome::Pending`]. The
    /// report's state stays [`ExecutorState::Idle`] since nothing ran; a
    /// failing check is recorded and ends the preview.
    pub fn preview<S: Session>(&mut self, plan: &Plan, session: S) -> Result<RunReport, PlanError> {
        let mut guard = SessionGuard::new(session);
        let order = plan.topological_order()?;
        let session: &mut dyn Session = &mut *guard;

        let started_at = Utc::now();
        let mut records = Vec::with_capacity(order.len());
        let mut failure = None;

        for step in &order {
            let started = Instant::now();
            let timestamp = Utc::now();
            let mut recording = RecordingSession::new(&mut *session);
            let result = self.retry(step.as_ref(), "check", || step.check(&mut recording));
            let outcome = match result {
                Ok(true) => StepOutcome::Skipped,
                Ok(false) => StepOutcome::Pending,
                Err(e) => {
                    let error = StepError::Check {
                        step: step.id().to_string(),
                        message: format!("{:#}", e),
                    };
                    let outcome = StepOutcome::Failed {
                        error: error.to_string(),
                    };
                    failure = Some(error);
                    outcome
                }
            };

            records.push(ExecutionRecord {
                step: step.id().to_string(),
                kind: step.kind().to_string(),
                outcome,
                timestamp,
                duration_ms: started.elapsed().as_millis() as u64,
                output: recording.into_traces(),
            });

            if failure.is_some() {
                break;
            }
        }

        Ok(RunReport {
            plan: plan.name().to_string(),
            host: session.host().to_string(),
            state: ExecutorState::Idle,
            records,
            error: failure,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// check -> apply -> verify for one step
    fn converge(&self, step: &dyn Step, session: &mut dyn Session) -> Result<Converged, Halt> {
        let satisfied = self
            .retry(step, "check", || step.check(&mut *session))
            .map_err(|e| Halt {
                error: StepError::Check {
                    step: step.id().to_string(),
                    message: format!("{:#}", e),
                },
                applied: false,
            })?;

        if satisfied {
            return Ok(Converged::Skipped);
        }

        self.retry(step, "apply", || step.apply(&mut *session))
            .map_err(|e| {
                let step = step.id().to_string();
                let message = format!("{:#}", e);
                let error = if is_transfer(&e) {
                    StepError::Transfer { step, message }
                } else {
                    StepError::Apply { step, message }
                };
                Halt {
                    error,
                    applied: false,
                }
            })?;

        match self.retry(step, "verify", || step.check(&mut *session)) {
            Ok(true) => Ok(Converged::Applied),
            Ok(false) => Err(Halt {
                error: StepError::NonIdempotent {
                    step: step.id().to_string(),
                },
                applied: true,
            }),
            Err(e) => Err(Halt {
                error: StepError::Check {
                    step: step.id().to_string(),
                    message: format!("{:#}", e),
                },
                applied: true,
            }),
        }
    }

    /// Undo applied steps newest first. Failures are logged, never raised.
    fn rollback<P: ProgressCallback>(
        &self,
        applied: &[SharedStep],
        session: &mut dyn Session,
        progress: &mut P,
        records: &mut Vec<ExecutionRecord>,
    ) {
        if applied.is_empty() {
            return;
        }

        log::warn!(
            "[{}] rolling back {} applied step(s)",
            session.host(),
            applied.len()
        );
        progress.on_rollback_start(applied.len());

        for step in applied.iter().rev() {
            let started = Instant::now();
            let timestamp = Utc::now();
            let mut recording = RecordingSession::new(&mut *session);

            let outcome = if step.supports_undo() {
                match self.retry(step.as_ref(), "undo", || step.undo(&mut recording)) {
                    Ok(()) => StepOutcome::Undone,
                    Err(e) => {
                        log::warn!("undo failed for {}: {:#}", step.id(), e);
                        StepOutcome::UndoFailed {
                            error: format!("{:#}", e),
                        }
                    }
                }
            } else {
                log::debug!("{} has no undo action", step.id());
                StepOutcome::UndoUnsupported
            };

            let record = ExecutionRecord {
                step: step.id().to_string(),
                kind: step.kind().to_string(),
                outcome,
                timestamp,
                duration_ms: started.elapsed().as_millis() as u64,
                output: recording.into_traces(),
            };
            progress.on_step_complete(&record);
            records.push(record);
        }
    }

    /// Let applied steps drop their undo data. Failures are logged only.
    fn finish(&self, applied: &[SharedStep], session: &mut dyn Session) {
        for step in applied {
            if let Err(e) = self.retry(step.as_ref(), "finish", || step.finish(&mut *session)) {
                log::warn!("[{}] cleanup failed for {}: {:#}", session.host(), step.id(), e);
            }
        }
    }

    fn retry<T>(
        &self,
        step: &dyn Step,
        phase: &str,
        operation: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let label = format!("{} {}", phase, step.id());
        let callback = LogCallback { operation: &label };
        with_retry(&self.opts.retry, Some(&callback), operation)
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(ExecuteOptions::default())
    }
}

/// Simple execution without progress reporting or cancellation
pub fn execute_simple<S: Session>(plan: &Plan, session: S) -> Result<RunReport, PlanError> {
    Executor::default().execute(plan, session, &mut NoProgress)
}
