//! Core types shared by sessions, steps and the executor

use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Output;
use std::time::Duration;

/// Output of a command run through a [`Session`](crate::Session)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

impl CommandOutput {
    /// Build an output from an exit code and text streams
    pub fn new(exit_code: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Get stdout as a string
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Get stderr as a string
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// Options for [`Session::run`](crate::Session::run)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Run with elevated privileges
    pub sudo: bool,
    /// Run as this user (implies sudo)
    pub sudo_user: Option<String>,
    /// Working directory on the remote host
    pub cwd: Option<String>,
    /// Environment assignments applied to the command
    pub env: Vec<(String, String)>,
    /// Per-command timeout, overriding the session default
    pub timeout: Option<Duration>,
}

impl RunOptions {
    /// Plain, unprivileged command
    pub fn new() -> Self {
        Self::default()
    }

    /// Privileged command
    pub fn sudo() -> Self {
        Self {
            sudo: true,
            ..Self::default()
        }
    }

    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.sudo = true;
        self.sudo_user = Some(user.into());
        self
    }

    pub fn in_dir(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether the command runs privileged (directly or as another user)
    pub fn is_privileged(&self) -> bool {
        self.sudo || self.sudo_user.is_some()
    }
}

/// Options for [`Session::put_file`](crate::Session::put_file)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Write the file with elevated privileges
    pub sudo: bool,
    /// Octal file mode, e.g. `0o644`
    pub mode: Option<u32>,
    /// Owner as `user` or `user:group`
    pub owner: Option<String>,
}

impl PutOptions {
    pub fn sudo() -> Self {
        Self {
            sudo: true,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Lifecycle state of an executor run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorState {
    Idle,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl ExecutorState {
    /// Whether the run has reached a final state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

/// Options for execution
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Retry policy for transient transport failures
    pub retry: crate::retry::RetryConfig,
}
