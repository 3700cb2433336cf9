//! Session over the system `ssh` client
//!
//! One ControlMaster connection is opened per session and every command is
//! multiplexed over it, so authentication happens once per host.

use super::{HostSpec, SshOptions, compose, is_transient_message, quote};
use declarative::{CommandOutput, PutOptions, RunOptions, Session, SessionError};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Exit status the ssh client uses for its own failures
const SSH_FAILURE: i32 = 255;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Background master; one orphaned by an abort exits a minute after its last client
const MASTER_ARGS: [&str; 5] = ["-M", "-N", "-f", "-o", "ControlPersist=60"];

pub struct SshSession {
    spec: HostSpec,
    label: String,
    options: SshOptions,
    /// Holds the control socket; removed on drop
    control_dir: Option<TempDir>,
}

impl SshSession {
    /// Authenticate and start the shared master connection
    pub fn open(spec: &HostSpec, options: &SshOptions) -> Result<Self, SessionError> {
        let connection_error = |message: String| SessionError::Connection {
            host: spec.to_string(),
            message,
        };

        let control_dir = tempfile::Builder::new()
            .prefix("stackup-ssh-")
            .tempdir()
            .map_err(|e| connection_error(format!("cannot create control directory: {}", e)))?;

        // The master daemonizes with inherited fds; a pipe would never see EOF
        let log_path = control_dir.path().join("master.log");
        let log = File::create(&log_path)
            .map_err(|e| connection_error(format!("cannot create {}: {}", log_path.display(), e)))?;

        let session = Self {
            spec: spec.clone(),
            label: spec.host.clone(),
            options: options.clone(),
            control_dir: Some(control_dir),
        };

        log::debug!("[{}] opening ssh master connection", session.label);
        let status = session
            .base_command()
            .args(MASTER_ARGS)
            .arg(spec.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(log)
            .status()
            .map_err(|e| connection_error(format!("cannot run ssh: {}", e)))?;

        if !status.success() {
            let detail = std::fs::read_to_string(&log_path).unwrap_or_default();
            let detail = detail.trim();
            return Err(connection_error(if detail.is_empty() {
                format!("ssh exited with {}", status)
            } else {
                detail.to_string()
            }));
        }

        log::info!("[{}] connected as {}", session.label, spec.destination());
        Ok(session)
    }

    fn control_path(&self) -> Option<PathBuf> {
        self.control_dir.as_ref().map(|d| d.path().join("master.sock"))
    }

    /// `ssh` with connection options but no destination
    fn base_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.options.connect_timeout.as_secs().max(1)
            ))
            .args(["-o", "ServerAliveInterval=15"]);

        if let Some(path) = self.control_path() {
            cmd.arg("-o").arg(format!("ControlPath={}", path.display()));
        }
        if let Some(port) = self.spec.port {
            cmd.arg("-p").arg(port.to_string());
        }
        if let Some(identity) = &self.options.identity_file {
            cmd.arg("-i").arg(identity);
        }

        // Keep Ctrl-C for the executor; remote commands finish or time out.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }

    /// Spawn `line` on the remote host with stdin from `input`
    fn spawn(&self, line: &str, input: bool) -> Result<Child, SessionError> {
        self.base_command()
            .arg(self.spec.destination())
            .arg("--")
            .arg(line)
            .stdin(if input { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SessionError::Command {
                command: line.to_string(),
                message: format!("cannot run ssh: {}", e),
                transient: false,
            })
    }

    /// Run `line`, optionally feeding `input`, and wait up to `timeout`
    fn execute(
        &self,
        command: &str,
        line: &str,
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput, SessionError> {
        if self.control_dir.is_none() {
            return Err(SessionError::Closed);
        }

        log::trace!("[{}] {}", self.label, line);
        let mut child = self.spawn(line, input.is_some())?;

        let writer = match (input, child.stdin.take()) {
            (Some(data), Some(stdin)) => Some(feed(stdin, data.to_vec())),
            _ => None,
        };

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= timeout => {
                    log::warn!(
                        "[{}] `{}` exceeded {}s, killing it",
                        self.label,
                        command,
                        timeout.as_secs()
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    if let Some(writer) = writer {
                        let _ = writer.join();
                    }
                    return Err(SessionError::Timeout {
                        command: command.to_string(),
                        after: timeout,
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    return Err(SessionError::Command {
                        command: command.to_string(),
                        message: e.to_string(),
                        transient: false,
                    });
                }
            }
        };

        let output = CommandOutput {
            exit_code: status.code(),
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        };
        let written = writer.map_or(Ok(()), |w| fed(w, command));

        if output.exit_code == Some(SSH_FAILURE) {
            let message = output.stderr_str().trim().to_string();
            return Err(SessionError::Command {
                command: command.to_string(),
                transient: is_transient_message(&message),
                message,
            });
        }

        // Only a zero exit can hide a short write
        if output.success() {
            written?;
        }
        Ok(output)
    }
}

/// Write `data` to a child's stdin on a helper thread so a full stdout pipe
/// cannot deadlock the upload. Stdin closes when the thread ends.
fn feed<W: Write + Send + 'static>(mut stdin: W, data: Vec<u8>) -> thread::JoinHandle<io::Result<()>> {
    thread::spawn(move || {
        stdin.write_all(&data)?;
        stdin.flush()
    })
}

/// Wait for a [`feed`] thread
fn fed(writer: thread::JoinHandle<io::Result<()>>, command: &str) -> Result<(), SessionError> {
    let message = match writer.join() {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => format!("cannot write input: {}", e),
        Err(_) => "input writer panicked".to_string(),
    };
    Err(SessionError::Command {
        command: command.to_string(),
        message,
        transient: false,
    })
}

/// Command failures during an upload are reported against the target path
fn as_transfer(path: &str, error: SessionError) -> SessionError {
    match error {
        SessionError::Command { message, .. } => SessionError::Transfer {
            path: path.to_string(),
            message,
        },
        other => other,
    }
}

/// Read a pipe to the end on a helper thread
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Remote script that installs stdin at `path`
fn install_script(path: &str, opts: &PutOptions) -> String {
    let mode = format!("{:o}", opts.mode.unwrap_or(0o644));
    let mut install = format!("install -m {}", mode);
    if let Some(owner) = &opts.owner {
        let (user, group) = owner.split_once(':').unwrap_or((owner.as_str(), ""));
        install.push_str(&format!(" -o {}", quote(user)));
        if !group.is_empty() {
            install.push_str(&format!(" -g {}", quote(group)));
        }
    }

    format!(
        "tmp=$(mktemp) && cat > \"$tmp\" && {} \"$tmp\" {}; rc=$?; rm -f \"$tmp\"; exit $rc",
        install,
        quote(path)
    )
}

impl Session for SshSession {
    fn host(&self) -> &str {
        &self.label
    }

    fn run(&mut self, command: &str, opts: &RunOptions) -> Result<CommandOutput, SessionError> {
        let line = compose(command, opts);
        let timeout = opts.timeout.unwrap_or(self.options.command_timeout);
        self.execute(command, &line, None, timeout)
    }

    fn put_file(
        &mut self,
        content: &[u8],
        remote_path: &str,
        opts: &PutOptions,
    ) -> Result<(), SessionError> {
        let script = install_script(remote_path, opts);
        let run_opts = if opts.sudo {
            RunOptions::sudo()
        } else {
            RunOptions::new()
        };
        let line = compose(&script, &run_opts);

        let output = self
            .execute(
                &format!("put {}", remote_path),
                &line,
                Some(content),
                self.options.command_timeout,
            )
            .map_err(|e| as_transfer(remote_path, e))?;

        if !output.success() {
            return Err(SessionError::Transfer {
                path: remote_path.to_string(),
                message: output.stderr_str().trim().to_string(),
            });
        }
        log::debug!("[{}] wrote {} ({} bytes)", self.label, remote_path, content.len());
        Ok(())
    }

    fn close(&mut self) {
        let Some(dir) = self.control_dir.take() else {
            return;
        };

        let socket = dir.path().join("master.sock");
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", socket.display()))
            .args(["-O", "exit"])
            .arg(self.spec.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match cmd.status() {
            Ok(status) if status.success() => {
                log::debug!("[{}] ssh master closed", self.label);
            }
            Ok(status) => log::debug!("[{}] ssh -O exit returned {}", self.label, status),
            Err(e) => log::warn!("[{}] could not stop ssh master: {}", self.label, e),
        }

        if let Err(e) = dir.close() {
            log::debug!("[{}] could not remove control directory: {}", self.label, e);
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.close();
    }
}
