mod cli;
mod commands;
mod config;
mod paths;
mod progress;
mod roles;
mod session;
mod steps;
mod templates;
mod ui;

use anyhow::Result;
use clap_complete::generate;
use cli::{Builtin, Invocation};
use config::StackupConfig;
use declarative::CancelToken;
use signal_hook::consts::SIGINT;
use std::io;

/// Exit code when a second Ctrl-C aborts without rolling back
const EXIT_INTERRUPTED: i32 = 130;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            ui::error(&format!("{:#}", e));
            commands::provision::EXIT_ERROR
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let registry = roles::registry()?;
    let matches = match cli::command(&registry)?.try_get_matches() {
        Ok(matches) => matches,
        Err(e) => {
            // --help and --version also arrive here
            let _ = e.print();
            return Ok(if e.use_stderr() {
                commands::provision::EXIT_ERROR
            } else {
                commands::provision::EXIT_OK
            });
        }
    };
    let (globals, invocation) = cli::parse(&registry, &matches)?;

    // Initialize logging based on verbosity
    let log_level = match globals.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if globals.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: globals.verbose,
        quiet: globals.quiet,
    };

    let mut config = StackupConfig::load(globals.config.as_deref())?;
    config.apply_overrides(&globals.overrides())?;

    match invocation {
        Invocation::Builtin(Builtin::Roles) => {
            commands::roles::run(&ctx, &registry)?;
            Ok(commands::provision::EXIT_OK)
        }
        Invocation::Builtin(Builtin::Plan { role, params }) => {
            let params = cli::bind_params(&registry, &role, &params)?;
            commands::plan::run(&ctx, &registry, &config, &role, &params, &globals.only)?;
            Ok(commands::provision::EXIT_OK)
        }
        Invocation::Builtin(Builtin::Completions { shell }) => {
            let mut cmd = cli::command(&registry)?;
            generate(shell, &mut cmd, "stackup", &mut io::stdout());
            Ok(commands::provision::EXIT_OK)
        }
        Invocation::Provision { role, params } => {
            let cancel = install_interrupt_handler()?;
            commands::provision::run(&ctx, &registry, &globals, &config, &role, &params, &cancel)
        }
    }
}

/// First Ctrl-C cancels between steps and rolls back; a second one exits.
fn install_interrupt_handler() -> Result<CancelToken> {
    let token = CancelToken::new();
    let flag = token.flag();
    // Registered first, so it sees the flag before this press sets it
    signal_hook::flag::register_conditional_shutdown(SIGINT, EXIT_INTERRUPTED, flag.clone())?;
    signal_hook::flag::register(SIGINT, flag)?;
    Ok(token)
}
