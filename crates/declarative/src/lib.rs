//! # Declarative
//!
//! A framework for declarative remote provisioning.
//!
//! This crate provides the core abstractions for describing desired state on
//! a remote host, probing for it, and converging the host to match, with
//! rollback when a run fails part-way.
//!
//! ## Core Concepts
//!
//! - **Session**: One connection to a target host (run commands, put files)
//! - **Step**: A single idempotent unit of desired state (check/apply/undo)
//! - **Plan**: Steps with declared dependencies, ordered topologically
//! - **Executor**: Applies a plan over a session with retry and rollback
//! - **RoleRegistry**: Named plans with inter-role dependencies
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{Executor, NoProgress, Plan, Role, RoleParams, RoleRegistry};
//!
//! let mut registry = RoleRegistry::new();
//! registry.register(Role::new("web", |_params| {
//!     let mut plan = Plan::new("web");
//!     plan.add(InstallNginx).add_after(RenderSite, ["install-nginx"]);
//!     Ok(plan)
//! }))?;
//!
//! let plan = registry.resolve("web", &RoleParams::new())?;
//! let report = Executor::default().execute(&plan, session, &mut NoProgress)?;
//! assert!(report.is_success());
//! ```
//!
//! ## Provider Traits
//!
//! - [`Session`]: Transport to the target host
//! - [`Step`]: Desired state and how to reach it
//! - [`ProgressCallback`]: Receives progress updates
//!
//! This keeps the crate free of any particular transport, terminal UI or
//! signal handling.

pub mod context;
pub mod error;
pub mod executor;
pub mod plan;
pub mod record;
pub mod registry;
pub mod retry;
pub mod session;
pub mod step;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use context::{CancelToken, NoProgress, ProgressCallback};
pub use error::{PlanError, RegistryError, SessionError, StepError, is_transient};
pub use executor::{Executor, execute_simple};
pub use plan::{Plan, PlanEntry};
pub use record::{CommandTrace, ExecutionRecord, RunReport, RunSummary, StepOutcome};
pub use registry::{Role, RoleParams, RoleRegistry};
pub use retry::{LogCallback, RetryCallback, RetryConfig, with_retry};
pub use session::{Session, SessionGuard, exit_label};
pub use step::{SharedStep, Step};
pub use types::{CommandOutput, ExecuteOptions, ExecutorState, PutOptions, RunOptions};
