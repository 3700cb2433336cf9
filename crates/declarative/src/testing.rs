//! In-memory host and step doubles shared by the crate's tests

use crate::error::SessionError;
use crate::session::Session;
use crate::step::Step;
use crate::types::{CommandOutput, PutOptions, RunOptions};
use anyhow::Result;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

/// Remote state for fake steps: a set of satisfied keys
#[derive(Debug, Default)]
pub struct FakeHost {
    pub state: BTreeSet<String>,
    /// Every command received, in order
    pub log: Vec<String>,
    /// Keys whose apply exits non-zero
    pub failing: BTreeSet<String>,
    /// Remaining transient transport failures per command
    pub transient: HashMap<String, u32>,
    /// Keys whose `finish` ran, in order
    pub finished: Vec<String>,
    pub closes: u32,
}

impl FakeHost {
    pub fn shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::default()))
    }
}

pub struct FakeSession {
    pub host: Rc<RefCell<FakeHost>>,
}

impl FakeSession {
    pub fn connect(host: &Rc<RefCell<FakeHost>>) -> Self {
        Self { host: host.clone() }
    }
}

impl Session for FakeSession {
    fn host(&self) -> &str {
        "fake"
    }

    fn run(&mut self, command: &str, _opts: &RunOptions) -> Result<CommandOutput, SessionError> {
        let mut host = self.host.borrow_mut();
        host.log.push(command.to_string());

        if let Some(remaining) = host.transient.get_mut(command)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(SessionError::Command {
                command: command.to_string(),
                message: "Connection reset by peer".to_string(),
                transient: true,
            });
        }

        let (verb, key) = command.split_once(' ').unwrap_or((command, ""));
        let code = match verb {
            "check" => i32::from(!host.state.contains(key)),
            "apply" if host.failing.contains(key) => 1,
            "apply" => {
                host.state.insert(key.to_string());
                0
            }
            "undo" => {
                host.state.remove(key);
                0
            }
            "finish" => {
                host.finished.push(key.to_string());
                0
            }
            "noop" => 0,
            _ => 127,
        };
        Ok(CommandOutput::new(code, "", ""))
    }

    fn put_file(&mut self, _: &[u8], path: &str, _: &PutOptions) -> Result<(), SessionError> {
        self.host.borrow_mut().log.push(format!("put {path}"));
        Ok(())
    }

    fn close(&mut self) {
        self.host.borrow_mut().closes += 1;
    }
}

/// Step that toggles a key on a [`FakeHost`]
#[derive(Debug, Clone)]
pub struct FakeStep {
    pub id: String,
    pub prerequisites: Vec<String>,
    pub undoable: bool,
    /// Apply reports success without changing state
    pub broken: bool,
}

impl FakeStep {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            prerequisites: Vec::new(),
            undoable: true,
            broken: false,
        }
    }

    pub fn after(mut self, prerequisite: &str) -> Self {
        self.prerequisites.push(prerequisite.to_string());
        self
    }

    pub fn without_undo(mut self) -> Self {
        self.undoable = false;
        self
    }

    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }
}

impl Step for FakeStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "fake"
    }

    fn description(&self) -> String {
        format!("Fake step {}", self.id)
    }

    fn prerequisites(&self) -> &[String] {
        &self.prerequisites
    }

    fn check(&self, session: &mut dyn Session) -> Result<bool> {
        Ok(session.run(&format!("check {}", self.id), &RunOptions::new())?.success())
    }

    fn apply(&self, session: &mut dyn Session) -> Result<()> {
        let verb = if self.broken { "noop" } else { "apply" };
        let output = session.run(&format!("{} {}", verb, self.id), &RunOptions::new())?;
        if !output.success() {
            anyhow::bail!("apply {} exited non-zero", self.id);
        }
        Ok(())
    }

    fn supports_undo(&self) -> bool {
        self.undoable
    }

    fn undo(&self, session: &mut dyn Session) -> Result<()> {
        session.run(&format!("undo {}", self.id), &RunOptions::new())?;
        Ok(())
    }

    fn finish(&self, session: &mut dyn Session) -> Result<()> {
        session.run(&format!("finish {}", self.id), &RunOptions::new())?;
        Ok(())
    }
}
