//! Step trait for idempotent remote state
//!
//! A Step describes one piece of desired state on the target host and
//! knows how to check for it, converge to it and (optionally) compensate.

use crate::session::Session;
use anyhow::Result;
use std::fmt;
use std::sync::Arc;

/// Core trait for provisioning steps
///
/// Every step provides:
/// - Identity (id, kind, description, prerequisites)
/// - A read-only test (`check`)
/// - Convergence (`apply`)
/// - An optional best-effort compensating action (`undo`)
/// - Cleanup after a completed run (`finish`)
///
/// # Contract
///
/// `check` must not mutate remote state. After a successful `apply`, an
/// immediate `check` must return `true`; the executor treats anything else
/// as a non-idempotent step.
///
/// # Example
///
/// ```ignore
/// use declarative::{PutOptions, RunOptions, Session, Step};
///
/// #[derive(Debug)]
/// struct Motd { text: String }
///
/// impl Step for Motd {
///     fn id(&self) -> &str { "file:/etc/motd" }
///     fn kind(&self) -> &'static str { "file" }
///     fn description(&self) -> String { "Write /etc/motd".into() }
///
///     fn check(&self, session: &mut dyn Session) -> anyhow::Result<bool> {
///         let output = session.run("cat /etc/motd", &RunOptions::new())?;
///         Ok(output.success() && output.stdout_str() == self.text)
///     }
///
///     fn apply(&self, session: &mut dyn Session) -> anyhow::Result<()> {
///         session.put_file(self.text.as_bytes(), "/etc/motd", &PutOptions::sudo())?;
///         Ok(())
///     }
/// }
/// ```
pub trait Step: Send + Sync + fmt::Debug {
    /// Stable name, unique within a plan (e.g. "package:nginx")
    fn id(&self) -> &str;

    /// Step kind label (e.g. "package", "file", "service")
    fn kind(&self) -> &'static str;

    /// Human-readable description
    fn description(&self) -> String;

    /// Names of steps that must run before this one
    fn prerequisites(&self) -> &[String] {
        &[]
    }

    /// Whether the desired state already holds. Must be side-effect-free.
    fn check(&self, session: &mut dyn Session) -> Result<bool>;

    /// Mutate remote state so that `check` holds
    fn apply(&self, session: &mut dyn Session) -> Result<()>;

    /// Whether `undo` performs a compensating action
    fn supports_undo(&self) -> bool {
        false
    }

    /// Best-effort compensation for a previous `apply` in the same run
    fn undo(&self, _session: &mut dyn Session) -> Result<()> {
        Ok(())
    }

    /// Discard what `apply` kept for `undo`, once the whole run completed
    fn finish(&self, _session: &mut dyn Session) -> Result<()> {
        Ok(())
    }
}

/// Shared, immutable step handle
///
/// Steps are reference-counted so role plans can be merged without
/// copying them.
pub type SharedStep = Arc<dyn Step>;
