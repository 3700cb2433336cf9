//! Remote session trait and scoped ownership helpers
//!
//! A session is one authenticated connection to a target host. The executor
//! owns it for exactly one run through [`SessionGuard`], which closes it on
//! every exit path.

use crate::error::SessionError;
use crate::record::CommandTrace;
use crate::types::{CommandOutput, PutOptions, RunOptions};
use anyhow::Result;
use std::ops::{Deref, DerefMut};

/// One connection to a target host.
///
/// Implementations execute commands, transfer files and release their
/// transport in [`close`](Session::close). `close` must be idempotent.
pub trait Session {
    /// Label used in logs and records (usually the host name)
    fn host(&self) -> &str;

    /// Run a shell command, returning its exit status and captured output.
    ///
    /// A non-zero exit is *not* an error; only transport loss is.
    fn run(&mut self, command: &str, opts: &RunOptions) -> Result<CommandOutput, SessionError>;

    /// Write `content` to `remote_path`.
    fn put_file(
        &mut self,
        content: &[u8],
        remote_path: &str,
        opts: &PutOptions,
    ) -> Result<(), SessionError>;

    /// Release the underlying connection. Safe to call more than once.
    fn close(&mut self);

    /// Run a command and return just success/failure
    fn run_status(&mut self, command: &str, opts: &RunOptions) -> Result<bool> {
        Ok(self.run(command, opts)?.success())
    }

    /// Run a command and capture stdout, failing on a non-zero exit
    fn run_capture(&mut self, command: &str, opts: &RunOptions) -> Result<String> {
        let output = self.run(command, opts)?;
        if !output.success() {
            anyhow::bail!(
                "`{}` exited with {}: {}",
                command,
                exit_label(&output),
                output.stderr_str().trim()
            );
        }
        Ok(output.stdout_str())
    }
}

impl<S: Session + ?Sized> Session for &mut S {
    fn host(&self) -> &str {
        (**self).host()
    }

    fn run(&mut self, command: &str, opts: &RunOptions) -> Result<CommandOutput, SessionError> {
        (**self).run(command, opts)
    }

    fn put_file(
        &mut self,
        content: &[u8],
        remote_path: &str,
        opts: &PutOptions,
    ) -> Result<(), SessionError> {
        (**self).put_file(content, remote_path, opts)
    }

    fn close(&mut self) {
        (**self).close();
    }
}

/// Human-readable exit status
pub fn exit_label(output: &CommandOutput) -> String {
    match output.exit_code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

/// Scoped owner of a session: closes it when dropped.
///
/// Dropping happens on normal return, early `?` return and unwinding, so
/// the connection is released even when step code panics.
pub struct SessionGuard<S: Session> {
    session: S,
}

impl<S: Session> SessionGuard<S> {
    pub fn new(session: S) -> Self {
        Self { session }
    }
}

impl<S: Session> Deref for SessionGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S: Session> DerefMut for SessionGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

impl<S: Session> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        log::debug!("closing session to {}", self.session.host());
        self.session.close();
    }
}

/// Longest stdout/stderr tail kept per captured command
const CAPTURE_LIMIT: usize = 4096;

/// Session wrapper that records every command issued through it.
pub(crate) struct RecordingSession<'a> {
    inner: &'a mut dyn Session,
    traces: Vec<CommandTrace>,
}

impl<'a> RecordingSession<'a> {
    pub(crate) fn new(inner: &'a mut dyn Session) -> Self {
        Self {
            inner,
            traces: Vec::new(),
        }
    }

    pub(crate) fn into_traces(self) -> Vec<CommandTrace> {
        self.traces
    }
}

impl Session for RecordingSession<'_> {
    fn host(&self) -> &str {
        self.inner.host()
    }

    fn run(&mut self, command: &str, opts: &RunOptions) -> Result<CommandOutput, SessionError> {
        log::trace!("[{}] $ {}", self.inner.host(), command);
        let result = self.inner.run(command, opts);
        let trace = match &result {
            Ok(output) => CommandTrace {
                command: command.to_string(),
                exit_code: output.exit_code,
                stdout: tail(&output.stdout_str()),
                stderr: tail(&output.stderr_str()),
            },
            Err(e) => CommandTrace {
                command: command.to_string(),
                exit_code: None,
                stdout: String::new(),
                stderr: e.to_string(),
            },
        };
        self.traces.push(trace);
        result
    }

    fn put_file(
        &mut self,
        content: &[u8],
        remote_path: &str,
        opts: &PutOptions,
    ) -> Result<(), SessionError> {
        let result = self.inner.put_file(content, remote_path, opts);
        self.traces.push(CommandTrace {
            command: format!("put {} ({} bytes)", remote_path, content.len()),
            exit_code: Some(i32::from(result.is_err())),
            stdout: String::new(),
            stderr: result.as_ref().err().map(ToString::to_string).unwrap_or_default(),
        });
        result
    }

    fn close(&mut self) {
        // The guard that owns the real session closes it
    }
}

fn tail(text: &str) -> String {
    let text = text.trim_end();
    if text.len() <= CAPTURE_LIMIT {
        return text.to_string();
    }
    let mut start = text.len() - CAPTURE_LIMIT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
