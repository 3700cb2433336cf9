//! Provision hosts with a role
//!
//! Each host gets its own SSH session and executor run on a rayon pool. A
//! host that cannot be reached never blocks the others.

use crate::Context;
use crate::cli::GlobalArgs;
use crate::config::StackupConfig;
use crate::progress::HostProgress;
use crate::session::{HostSpec, SshOptions, SshSession};
use crate::ui;
use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use declarative::{
    CancelToken, ExecuteOptions, Executor, ExecutorState, Plan, RoleParams, RoleRegistry,
    RunReport, SessionError, StepOutcome,
};
use indicatif::MultiProgress;
use rayon::prelude::*;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, IsTerminal};
use std::path::Path;

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_FAILED: i32 = 3;
pub const EXIT_ROLLED_BACK: i32 = 4;
pub const EXIT_CONNECTION: i32 = 5;

/// How one host's run ended
#[derive(Debug)]
pub enum HostOutcome {
    Finished(RunReport),
    Unreachable { host: String, error: SessionError },
    Aborted { host: String, message: String },
}

impl HostOutcome {
    pub fn host(&self) -> &str {
        match self {
            Self::Finished(report) => &report.host,
            Self::Unreachable { host, .. } | Self::Aborted { host, .. } => host,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Finished(report) => match report.state {
                ExecutorState::Failed => EXIT_FAILED,
                ExecutorState::RolledBack => EXIT_ROLLED_BACK,
                // a dry run that hit a failing check
                _ if report.error.is_some() => EXIT_FAILED,
                _ => EXIT_OK,
            },
            Self::Unreachable { .. } => EXIT_CONNECTION,
            Self::Aborted { .. } => EXIT_ERROR,
        }
    }
}

fn severity(code: i32) -> u8 {
    match code {
        EXIT_ERROR => 4,
        EXIT_FAILED => 3,
        EXIT_ROLLED_BACK => 2,
        EXIT_CONNECTION => 1,
        _ => 0,
    }
}

/// Exit status across hosts: the most severe outcome wins
pub fn exit_code(outcomes: &[HostOutcome]) -> i32 {
    outcomes
        .iter()
        .map(HostOutcome::exit_code)
        .max_by_key(|&code| severity(code))
        .unwrap_or(EXIT_OK)
}

/// Resolve `role` and narrow it to `only` plus their dependencies
pub fn resolve_plan(
    registry: &RoleRegistry,
    role: &str,
    params: &RoleParams,
    only: &[String],
) -> Result<Plan> {
    let plan = registry.resolve(role, params)?;
    if only.is_empty() {
        return Ok(plan);
    }
    let filtered = plan.filter(only)?;
    log::info!(
        "--only kept {} of {} steps in {}",
        filtered.len(),
        plan.len(),
        role
    );
    Ok(filtered)
}

/// Settings from the config file, overridden by positional parameters
pub fn merge_params(config: &StackupConfig, params: &RoleParams) -> RoleParams {
    let mut merged = config.role_settings();
    merged.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

pub fn run(
    ctx: &Context,
    registry: &RoleRegistry,
    globals: &GlobalArgs,
    config: &StackupConfig,
    role: &str,
    params: &RoleParams,
    cancel: &CancelToken,
) -> Result<i32> {
    let plan = resolve_plan(registry, role, &merge_params(config, params), &globals.only)?;

    if globals.hosts.is_empty() {
        bail!("No hosts given; pass --host [user@]host[:port]");
    }
    let hosts: Vec<HostSpec> = globals
        .hosts
        .iter()
        .map(|h| {
            h.clone()
                .with_defaults(config.ssh.user.as_deref(), config.ssh.port)
        })
        .collect();

    if !ctx.quiet {
        let mode = if globals.dry_run { " (dry run)" } else { "" };
        ui::header(&format!("Provisioning {}{}", role, mode));
        ui::kv("steps", &plan.len().to_string());
        ui::kv(
            "hosts",
            &hosts
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        );
        println!();
    }

    if !globals.dry_run && !globals.yes && !confirm(role, hosts.len())? {
        ui::info("Nothing changed");
        return Ok(EXIT_OK);
    }

    let options = ExecuteOptions {
        retry: config.retry_config(),
    };
    let ssh = config.ssh_options();
    let multi = (!ctx.quiet).then(MultiProgress::new);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(globals.jobs.clamp(1, hosts.len()))
        .build()
        .context("Failed to create provisioning thread pool")?;

    let outcomes: Vec<HostOutcome> = pool.install(|| {
        hosts
            .par_iter()
            .map(|spec| {
                let mut progress = match &multi {
                    Some(multi) => HostProgress::new(multi, &spec.host),
                    None => HostProgress::hidden(&spec.host),
                };
                provision_host(
                    spec,
                    &plan,
                    &ssh,
                    &options,
                    cancel,
                    globals.dry_run,
                    &mut progress,
                )
            })
            .collect()
    });

    if let Some(multi) = &multi {
        let _ = multi.clear();
    }

    if !globals.dry_run
        && let Some(path) = config.log_path()
    {
        for outcome in &outcomes {
            if let HostOutcome::Finished(report) = outcome {
                append_log(&path, report)?;
            }
        }
        log::info!("Run log appended to {}", path.display());
    }

    for outcome in &outcomes {
        print_outcome(ctx, outcome, globals.dry_run);
    }

    Ok(exit_code(&outcomes))
}

fn confirm(role: &str, hosts: usize) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        bail!("Refusing to change hosts without confirmation; pass --yes or --dry-run");
    }

    let confirmed = dialoguer::Confirm::new()
        .with_prompt(format!("Apply {} to {} host(s)?", role, hosts))
        .default(false)
        .interact()?;
    Ok(confirmed)
}

fn provision_host(
    spec: &HostSpec,
    plan: &Plan,
    ssh: &SshOptions,
    options: &ExecuteOptions,
    cancel: &CancelToken,
    dry_run: bool,
    progress: &mut HostProgress,
) -> HostOutcome {
    let session = match SshSession::open(spec, ssh) {
        Ok(session) => session,
        Err(error) => {
            log::error!("[{}] {}", spec, error);
            progress.abandon(&error.to_string());
            return HostOutcome::Unreachable {
                host: spec.host.clone(),
                error,
            };
        }
    };

    let mut executor = Executor::new(options.clone()).with_cancel(cancel.clone());
    let result = if dry_run {
        executor.preview(plan, session)
    } else {
        executor.execute(plan, session, progress)
    };

    match result {
        Ok(report) => HostOutcome::Finished(report),
        Err(e) => HostOutcome::Aborted {
            host: spec.host.clone(),
            message: e.to_string(),
        },
    }
}

/// Append a report's records to the JSON-lines run log
pub fn append_log(path: &Path, report: &RunReport) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Could not create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Could not open run log {}", path.display()))?;
    report
        .write_jsonl(BufWriter::new(file))
        .with_context(|| format!("Could not write run log {}", path.display()))
}

fn print_outcome(ctx: &Context, outcome: &HostOutcome, dry_run: bool) {
    match outcome {
        HostOutcome::Finished(report) => {
            let summary = ui::summary_line(&report.summary());
            if dry_run {
                println!("{} {}", report.host.bold(), summary.dimmed());
                for record in &report.records {
                    if record.outcome == StepOutcome::Pending || ctx.verbose > 0 {
                        println!("  {} {}", ui::outcome_symbol(&record.outcome), record.step);
                    }
                }
            } else {
                println!(
                    "{} {} {}",
                    report.host.bold(),
                    ui::state_label(report.state),
                    summary.dimmed()
                );
            }

            if let Some(error) = &report.error {
                ui::error(&format!("{}: {}", report.host, error));
                for record in report.records.iter().filter(|r| r.outcome.is_rollback()) {
                    println!("  {} {}", ui::outcome_symbol(&record.outcome), record.step);
                    match &record.outcome {
                        StepOutcome::UndoFailed { error } => ui::dim(error),
                        StepOutcome::UndoUnsupported => {
                            ui::warn(&format!("{} cannot be undone, left in place", record.step));
                        }
                        _ => {}
                    }
                }
            }
        }
        HostOutcome::Unreachable { host, error } => {
            ui::error(&format!("{}: {}", host, error));
        }
        HostOutcome::Aborted { host, message } => {
            ui::error(&format!("{}: {}", host, message));
        }
    }
}
