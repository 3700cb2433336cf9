//! Error types for provisioning runs.
//!
//! Errors are split by the phase that produces them: session (transport),
//! plan and registry construction (raised before any remote mutation), and
//! the step failure that stops an executor run.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a [`Session`](crate::Session) implementation.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Cannot reach or authenticate to the host
    #[error("cannot connect to {host}: {message}")]
    Connection { host: String, message: String },

    /// Transport lost while running a command
    #[error("command `{command}` lost its transport: {message}")]
    Command {
        command: String,
        message: String,
        /// Whether the failure looks temporary (reset, timeout, broken pipe)
        transient: bool,
    },

    /// Command exceeded its timeout and was aborted
    #[error("command `{command}` timed out after {}s", .after.as_secs())]
    Timeout { command: String, after: Duration },

    /// File transfer failed
    #[error("transfer to {path} failed: {message}")]
    Transfer { path: String, message: String },

    /// Session used after `close()`
    #[error("session is closed")]
    Closed,
}

impl SessionError {
    /// Whether this error is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Command { transient, .. } => *transient,
            Self::Timeout { .. } => true,
            Self::Connection { .. } | Self::Transfer { .. } | Self::Closed => false,
        }
    }
}

/// Whether an error chain carries a retryable [`SessionError`].
pub fn is_transient(error: &anyhow::Error) -> bool {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<SessionError>())
        .is_some_and(SessionError::is_retryable)
}

/// Whether an error chain carries a transfer failure.
pub(crate) fn is_transfer(error: &anyhow::Error) -> bool {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<SessionError>())
        .is_some_and(|e| matches!(e, SessionError::Transfer { .. }))
}

/// Errors detected while validating a [`Plan`](crate::Plan).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("dependency cycle between steps: {}", .steps.join(", "))]
    Cycle { steps: Vec<String> },

    #[error("duplicate step name: {name}")]
    DuplicateName { name: String },

    #[error("step {step} depends on unknown step {dependency}")]
    DanglingDependency { step: String, dependency: String },

    #[error("no step named {name} in plan")]
    UnknownStep { name: String },
}

/// The failure that stopped an executor run.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepError {
    #[error("check failed for {step}: {message}")]
    Check { step: String, message: String },

    #[error("apply failed for {step}: {message}")]
    Apply { step: String, message: String },

    #[error("transfer failed for {step}: {message}")]
    Transfer { step: String, message: String },

    /// `check` did not report satisfied right after a successful `apply`
    #[error("step {step} is not idempotent: check is unsatisfied after a successful apply")]
    NonIdempotent { step: String },

    #[error("run cancelled after {completed} step(s)")]
    Cancelled { completed: usize },
}

impl StepError {
    /// Name of the step that failed, if the failure belongs to one
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::Check { step, .. }
            | Self::Apply { step, .. }
            | Self::Transfer { step, .. }
            | Self::NonIdempotent { step } => Some(step),
            Self::Cancelled { .. } => None,
        }
    }

    /// Whether this failure triggers rollback of the steps applied so far
    pub fn triggers_rollback(&self) -> bool {
        !matches!(self, Self::NonIdempotent { .. })
    }
}

/// Errors raised while registering or resolving roles.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown role: {name}")]
    UnknownRole { name: String },

    #[error("circular role dependency: {}", .path.join(" -> "))]
    RoleCycle { path: Vec<String> },

    #[error("role {name} is already registered")]
    DuplicateRole { name: String },

    #[error("role {role} requires parameter {param}")]
    MissingParameter { role: String, param: String },

    #[error("failed to build plan for role {role}")]
    Build {
        role: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid plan for role {role}")]
    Plan {
        role: String,
        #[source]
        source: PlanError,
    },
}
