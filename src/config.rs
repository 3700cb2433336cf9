//! stackup configuration (`config.toml`)
//!
//! ```toml
//! [ssh]
//! user = "ubuntu"
//! port = 22
//! identity_file = "~/.ssh/id_ed25519"
//! connect_timeout_secs = 10
//! command_timeout_secs = 600
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 500
//! backoff_factor = 2.0
//! max_delay_ms = 10000
//!
//! [settings]
//! graphite_root = "/opt/graphite"
//! timezone = "Pacific/Auckland"
//!
//! [log]
//! path = "~/.local/state/stackup/runs.jsonl"
//! ```
//!
//! Every section and key is optional. Command-line flags win over the file.

use crate::paths;
use crate::roles::{SETTING_GRAPHITE_ROOT, SETTING_TIMEZONE};
use crate::session::SshOptions;
use anyhow::{Context, Result, bail};
use declarative::{RetryConfig, RoleParams};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StackupConfig {
    pub ssh: SshConfig,
    pub retry: RetrySettings,
    pub settings: Settings,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        let defaults = SshOptions::default();
        Self {
            user: None,
            port: None,
            identity_file: None,
            connect_timeout_secs: defaults.connect_timeout.as_secs(),
            command_timeout_secs: defaults.command_timeout.as_secs(),
        }
    }
}

/// Retry policy for transient transport failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            backoff_factor: defaults.backoff_factor,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
        }
    }
}

/// Role settings that are not positional parameters
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub graphite_root: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Append-only JSON-lines run log
    pub path: Option<String>,
}

/// Values given on the command line that replace file settings
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
    pub retries: Option<u32>,
    pub command_timeout_secs: Option<u64>,
    pub log: Option<PathBuf>,
}

impl StackupConfig {
    /// Load from `explicit`, or from the default location when it exists.
    ///
    /// An explicit path that does not exist is an error; a missing default
    /// file yields the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                path.to_path_buf()
            }
            None => {
                let path = paths::config_file()?;
                if !path.exists() {
                    log::debug!("No config at {}, using defaults", path.display());
                    return Ok(Self::default());
                }
                path
            }
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Invalid TOML format")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_factor.is_nan() || self.retry.backoff_factor < 1.0 {
            bail!(
                "retry.backoff_factor must be at least 1.0, got {}",
                self.retry.backoff_factor
            );
        }
        if self.ssh.connect_timeout_secs == 0 || self.ssh.command_timeout_secs == 0 {
            bail!("ssh timeouts must be greater than zero");
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) -> Result<()> {
        if let Some(user) = &overrides.user {
            self.ssh.user = Some(user.clone());
        }
        if let Some(port) = overrides.port {
            self.ssh.port = Some(port);
        }
        if let Some(identity) = &overrides.identity_file {
            self.ssh.identity_file = Some(identity.display().to_string());
        }
        if let Some(retries) = overrides.retries {
            // --retries counts retries, not attempts
            self.retry.max_attempts = retries.saturating_add(1);
        }
        if let Some(secs) = overrides.command_timeout_secs {
            self.ssh.command_timeout_secs = secs;
        }
        if let Some(log) = &overrides.log {
            self.log.path = Some(log.display().to_string());
        }
        self.validate()
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            identity_file: self.ssh.identity_file.as_deref().map(paths::expand),
            connect_timeout: Duration::from_secs(self.ssh.connect_timeout_secs),
            command_timeout: Duration::from_secs(self.ssh.command_timeout_secs),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            backoff_factor: self.retry.backoff_factor,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    /// Settings as role parameters, for merging with positional ones
    pub fn role_settings(&self) -> RoleParams {
        let mut params = RoleParams::new();
        if let Some(root) = &self.settings.graphite_root {
            params.insert(SETTING_GRAPHITE_ROOT.to_string(), root.clone());
        }
        if let Some(timezone) = &self.settings.timezone {
            params.insert(SETTING_TIMEZONE.to_string(), timezone.clone());
        }
        params
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.log.path.as_deref().map(paths::expand)
    }
}
