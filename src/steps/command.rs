//! Guarded shell command step
//!
//! Arbitrary commands are only idempotent with a guard, so an `Exec` cannot
//! be built without one.

use anyhow::Result;
use declarative::{RunOptions, Session, Step};

use super::{STATE_DIR, exists, names, quote, sudo};

/// How an [`Exec`] decides that its command has already run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// Satisfied once the path exists
    Creates(String),
    /// Satisfied once the path is gone
    Removes(String),
    /// Satisfied while this command exits 0
    Unless(String),
    /// Satisfied after one successful run, tracked by a stamp file
    Once(String),
}

impl Guard {
    pub fn creates(path: impl Into<String>) -> Self {
        Self::Creates(path.into())
    }

    pub fn removes(path: impl Into<String>) -> Self {
        Self::Removes(path.into())
    }

    pub fn unless(command: impl Into<String>) -> Self {
        Self::Unless(command.into())
    }

    pub fn once(name: impl Into<String>) -> Self {
        Self::Once(name.into())
    }
}

#[derive(Debug, Clone)]
pub struct Exec {
    id: String,
    command: String,
    guard: Guard,
    opts: RunOptions,
    undo: Option<String>,
    after: Vec<String>,
}

impl Exec {
    pub fn new(id: impl Into<String>, command: impl Into<String>, guard: Guard) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            guard,
            opts: sudo(),
            undo: None,
            after: Vec::new(),
        }
    }

    /// Run from `dir`; relative guard paths resolve against it too
    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.opts = self.opts.in_dir(dir);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.opts = self.opts.with_env(key, value);
        self
    }

    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.opts = self.opts.as_user(user);
        self
    }

    /// Compensating command for rollback
    pub fn undo_with(mut self, command: impl Into<String>) -> Self {
        self.undo = Some(command.into());
        self
    }

    pub fn after<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after.extend(names(steps));
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn stamp(name: &str) -> String {
        format!("{}/once/{}", STATE_DIR, name)
    }
}

impl Step for Exec {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "command"
    }

    fn description(&self) -> String {
        match &self.opts.cwd {
            Some(dir) => format!("Run `{}` in {}", self.command, dir),
            None => format!("Run `{}`", self.command),
        }
    }

    fn prerequisites(&self) -> &[String] {
        &self.after
    }

    fn check(&self, session: &mut dyn Session) -> Result<bool> {
        match &self.guard {
            Guard::Creates(path) => exists(session, path, &self.opts),
            Guard::Removes(path) => Ok(!exists(session, path, &self.opts)?),
            Guard::Unless(command) => session.run_status(command, &self.opts),
            Guard::Once(name) => exists(session, &Self::stamp(name), &sudo()),
        }
    }

    fn apply(&self, session: &mut dyn Session) -> Result<()> {
        session.run_capture(&self.command, &self.opts)?;

        if let Guard::Once(name) = &self.guard {
            session.run_capture(
                &format!("mkdir -p {}", quote(&format!("{}/once", STATE_DIR))),
                &sudo(),
            )?;
            session.run_capture(&format!("touch {}", quote(&Self::stamp(name))), &sudo())?;
        }
        Ok(())
    }

    fn supports_undo(&self) -> bool {
        self.undo.is_some()
    }

    fn undo(&self, session: &mut dyn Session) -> Result<()> {
        let Some(command) = &self.undo else {
            return Ok(());
        };
        session.run_capture(command, &self.opts)?;

        if let Guard::Once(name) = &self.guard {
            session.run_capture(&format!("rm -f {}", quote(&Self::stamp(name))), &sudo())?;
        }
        Ok(())
    }
}
