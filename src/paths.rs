//! Path resolution for stackup
//!
//! # Environment Variables
//!
//! - `STACKUP_CONFIG_DIR` - Override config directory
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `STACKUP_CONFIG_DIR` environment variable
//! 2. Platform config dir (`dirs::config_dir()`), e.g. `~/.config/stackup`
//! 3. `~/.config/stackup` when the platform dir is unknown

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "STACKUP_CONFIG_DIR";

const APP_DIR: &str = "stackup";

/// Get the stackup config directory path
pub fn config_dir() -> Result<PathBuf> {
    resolve_config_dir(std::env::var(ENV_CONFIG_DIR).ok().as_deref())
}

/// Default location of `config.toml`
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

fn resolve_config_dir(env_override: Option<&str>) -> Result<PathBuf> {
    if let Some(dir) = env_override {
        let path = expand(dir);
        log::debug!(
            "Using config dir from {}: {}",
            ENV_CONFIG_DIR,
            path.display()
        );
        return Ok(path);
    }

    if let Some(config) = dirs::config_dir() {
        return Ok(config.join(APP_DIR));
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join(APP_DIR))
}

/// Expand ~ and environment variables in a path string.
///
/// Unknown variables are left as-is.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}
