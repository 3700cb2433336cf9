//! Remote sessions: host addressing, command composition and transports

pub mod ssh;

#[cfg(test)]
pub mod sim;

use declarative::RunOptions;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

pub use ssh::SshSession;

/// Errors parsing a `[user@]host[:port]` target
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostSpecError {
    #[error("empty host")]
    Empty,

    #[error("invalid port in {spec}: {port}")]
    InvalidPort { spec: String, port: String },

    #[error("empty user in {spec}")]
    EmptyUser { spec: String },

    #[error("unterminated IPv6 address in {spec}")]
    UnterminatedAddress { spec: String },

    #[error("unexpected {rest:?} after address in {spec}")]
    TrailingText { spec: String, rest: String },
}

/// A target host as given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
}

impl HostSpec {
    /// Fill unset user/port from defaults
    pub fn with_defaults(mut self, user: Option<&str>, port: Option<u16>) -> Self {
        if self.user.is_none() {
            self.user = user.map(String::from);
        }
        if self.port.is_none() {
            self.port = port;
        }
        self
    }

    /// `user@host` (or just `host`) as passed to ssh
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

impl FromStr for HostSpec {
    type Err = HostSpecError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(HostSpecError::Empty);
        }

        let (user, rest) = match spec.rsplit_once('@') {
            Some(("", _)) => {
                return Err(HostSpecError::EmptyUser {
                    spec: spec.to_string(),
                });
            }
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, spec),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let Some((host, after)) = bracketed.split_once(']') else {
                return Err(HostSpecError::UnterminatedAddress {
                    spec: spec.to_string(),
                });
            };
            match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if after.is_empty() => (host, None),
                None => {
                    return Err(HostSpecError::TrailingText {
                        spec: spec.to_string(),
                        rest: after.to_string(),
                    });
                }
            }
        } else {
            match rest.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(HostSpecError::Empty);
        }

        let port = port
            .map(|p| {
                p.parse::<u16>()
                    .ok()
                    .filter(|&p| p != 0)
                    .ok_or_else(|| HostSpecError::InvalidPort {
                        spec: spec.to_string(),
                        port: p.to_string(),
                    })
            })
            .transpose()?;

        Ok(Self {
            host: host.to_string(),
            user,
            port,
        })
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.destination())?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// Transport settings shared by every session of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            identity_file: None,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(600),
        }
    }
}

/// Quote a single shell word
pub fn quote(word: &str) -> String {
    match shlex::try_quote(word) {
        Ok(quoted) => quoted.into_owned(),
        // NUL cannot appear in a shell word
        Err(_) => quote(&word.replace('\0', "")),
    }
}

/// Quote and join shell words
pub fn join<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|w| quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the remote shell line for `command` under `opts`.
///
/// `export K=V && cd DIR && command`, wrapped in `sudo -n -H [-u USER] sh -c`
/// when privileged.
pub fn compose(command: &str, opts: &RunOptions) -> String {
    let mut parts = Vec::new();
    if !opts.env.is_empty() {
        let assignments: Vec<String> = opts
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, quote(v)))
            .collect();
        parts.push(format!("export {}", assignments.join(" ")));
    }
    if let Some(cwd) = &opts.cwd {
        parts.push(format!("cd {}", quote(cwd)));
    }
    parts.push(command.to_string());
    let line = parts.join(" && ");

    if !opts.is_privileged() {
        return line;
    }

    let mut sudo = String::from("sudo -n -H");
    if let Some(user) = &opts.sudo_user {
        sudo.push_str(" -u ");
        sudo.push_str(&quote(user));
    }
    format!("{} sh -c {}", sudo, quote(&line))
}

static TRANSIENT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)connection (reset|closed|timed out|refused)|broken pipe|timed out|network is unreachable|no route to host|closed by remote host|kex_exchange_identification",
    )
    .ok()
});

/// Whether an ssh client error message looks temporary
pub fn is_transient_message(stderr: &str) -> bool {
    TRANSIENT.as_ref().is_some_and(|re| re.is_match(stderr))
}
