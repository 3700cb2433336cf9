//! Command line definition
//!
//! Roles are registered at runtime, so the command tree is built from the
//! registry: one subcommand per role taking one positional argument per
//! parameter the role (or any role it depends on) needs.

use crate::config::Overrides;
use crate::session::HostSpec;
use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Args, Command, FromArgMatches, Subcommand};
use clap_complete::Shell;
use declarative::{RoleParams, RoleRegistry};
use std::path::PathBuf;

/// Flags accepted before or after any subcommand
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Target host, `[user@]host[:port]` (repeatable)
    #[arg(short = 'H', long = "host", value_name = "HOST", global = true)]
    pub hosts: Vec<HostSpec>,

    /// Remote user when a host does not name one
    #[arg(short, long, global = true)]
    pub user: Option<String>,

    /// SSH port when a host does not name one
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// SSH private key
    #[arg(short, long, value_name = "FILE", global = true)]
    pub identity: Option<PathBuf>,

    /// Config file (default: ~/.config/stackup/config.toml)
    #[arg(short, long, value_name = "FILE", env = "STACKUP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Retries for transient connection failures
    #[arg(long, value_name = "N", global = true)]
    pub retries: Option<u32>,

    /// Per-command timeout in seconds
    #[arg(long, value_name = "SECS", global = true)]
    pub command_timeout: Option<u64>,

    /// Hosts provisioned in parallel
    #[arg(short, long, default_value = "4", global = true)]
    pub jobs: usize,

    /// Only run these steps (repeatable)
    #[arg(long = "only", value_name = "STEP", global = true)]
    pub only: Vec<String>,

    /// Check every step without changing anything
    #[arg(short = 'n', long, global = true)]
    pub dry_run: bool,

    /// Do not ask for confirmation
    #[arg(short, long, global = true)]
    pub yes: bool,

    /// Append run records to this JSON-lines file
    #[arg(long, value_name = "FILE", global = true)]
    pub log: Option<PathBuf>,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

impl GlobalArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            user: self.user.clone(),
            port: self.port,
            identity_file: self.identity.clone(),
            retries: self.retries,
            command_timeout_secs: self.command_timeout,
            log: self.log.clone(),
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Builtin {
    /// List roles with their dependencies and parameters
    Roles,

    /// Print the resolved step order for a role without connecting
    Plan {
        /// Role to resolve
        role: String,

        /// Role parameters, in the order `roles` lists them
        params: Vec<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// What to do after parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Builtin(Builtin),
    Provision { role: String, params: RoleParams },
}

/// Build the full command tree for `registry`
pub fn command(registry: &RoleRegistry) -> Result<Command> {
    let mut cmd = Command::new("stackup")
        .author("Alberto Cavalcante")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Idempotent, role-based provisioning of a graphite/statsd metrics stack over SSH")
        .propagate_version(true)
        .subcommand_required(true)
        .arg_required_else_help(true);
    cmd = GlobalArgs::augment_args(cmd);
    cmd = Builtin::augment_subcommands(cmd);

    for role in registry.roles() {
        let mut sub = Command::new(role.name().to_string()).about(role.description().to_string());
        for param in registry.required_params(role.name())? {
            sub = sub.arg(
                Arg::new(param.clone())
                    .value_name(param.to_uppercase())
                    .required(true),
            );
        }
        cmd = cmd.subcommand(sub);
    }
    Ok(cmd)
}

/// Split parsed matches into global flags and the chosen action
pub fn parse(registry: &RoleRegistry, matches: &ArgMatches) -> Result<(GlobalArgs, Invocation)> {
    let globals = GlobalArgs::from_arg_matches(matches)?;

    if let Some((name, sub)) = matches.subcommand()
        && let Some(role) = registry.get(name)
    {
        let mut params = RoleParams::new();
        for param in registry.required_params(role.name())? {
            let value = sub
                .get_one::<String>(&param)
                .with_context(|| format!("missing value for {}", param))?;
            params.insert(param, value.clone());
        }
        return Ok((
            globals,
            Invocation::Provision {
                role: name.to_string(),
                params,
            },
        ));
    }

    let builtin = Builtin::from_arg_matches(matches)?;
    Ok((globals, Invocation::Builtin(builtin)))
}

/// Pair `values` with the parameters `role` needs, in order
pub fn bind_params(registry: &RoleRegistry, role: &str, values: &[String]) -> Result<RoleParams> {
    let names = registry.required_params(role)?;
    if values.len() != names.len() {
        anyhow::bail!(
            "{} takes {} parameter(s) ({}), got {}",
            role,
            names.len(),
            names.join(", "),
            values.len()
        );
    }
    Ok(names.into_iter().zip(values.iter().cloned()).collect())
}
