//! Service restart step
//!
//! A restart is recorded as a stamp file. The service is satisfied while it
//! runs and no watched file is newer than the stamp, so a changed config
//! file triggers exactly one restart.
//!
//! Undo only stops a service this run started. One that was already running
//! stays up and loses its stamp, so the next run restarts it again.

use anyhow::Result;
use declarative::{Session, Step};

use super::{STATE_DIR, exists, names, quote, sudo};

#[derive(Debug, Clone)]
pub struct Service {
    id: String,
    name: String,
    watch: Vec<String>,
    after: Vec<String>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: format!("service:{}", name),
            name,
            watch: Vec::new(),
            after: Vec::new(),
        }
    }

    pub fn named(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Restart again whenever `path` changes
    pub fn watching(mut self, path: impl Into<String>) -> Self {
        self.watch.push(path.into());
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

    fn stamp(&self) -> String {
        format!("{}/restart-{}", STATE_DIR, self.name)
    }

    /// Present while a run that found the service running is in flight
    fn marker(&self) -> String {
        format!("{}.was-running", self.stamp())
    }

    fn is_running(&self, session: &mut dyn Session) -> Result<bool> {
        let output = session.run(&format!("service {} status", quote(&self.name)), &sudo())?;
        // upstart reports a stopped job with exit status 0
        Ok(output.success() && !output.stdout_str().contains("stop/waiting"))
    }
}

impl Step for Service {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "service"
    }

    fn description(&self) -> String {
        format!("Restart {}", self.name)
    }

    fn prerequisites(&self) -> &[String] {
        &self.after
    }

    fn check(&self, session: &mut dyn Session) -> Result<bool> {
        if !self.is_running(session)? {
            return Ok(false);
        }

        let stamp = self.stamp();
        if !exists(session, &stamp, &sudo())? {
            return Ok(false);
        }

        for path in &self.watch {
            let newer = session.run_status(
                &format!("test {} -nt {}", quote(path), quote(&stamp)),
                &sudo(),
            )?;
            if newer {
                log::debug!("[{}] {} changed since last restart", session.host(), path);
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn apply(&self, session: &mut dyn Session) -> Result<()> {
        let name = quote(&self.name);
        let was_running = self.is_running(session)?;
        session.run_capture(&format!("mkdir -p {}", quote(STATE_DIR)), &sudo())?;
        let marker = if was_running { "touch" } else { "rm -f" };
        session.run_capture(&format!("{} {}", marker, quote(&self.marker())), &sudo())?;

        let restart = session.run(&format!("service {} restart", name), &sudo())?;
        if !restart.success() {
            log::debug!(
                "[{}] restart of {} failed, starting it instead",
                session.host(),
                self.name
            );
            session.run_capture(&format!("service {} start", name), &sudo())?;
        }

        session.run_capture(&format!("touch {}", quote(&self.stamp())), &sudo())?;
        Ok(())
    }

    fn supports_undo(&self) -> bool {
        true
    }

    fn undo(&self, session: &mut dyn Session) -> Result<()> {
        let name = quote(&self.name);
        let marker = self.marker();
        if exists(session, &marker, &sudo())? {
            // Stays up; without a stamp the next run restarts it
            if !self.is_running(session)? {
                session.run_capture(&format!("service {} start", name), &sudo())?;
            }
            session.run_capture(&format!("rm -f {}", quote(&marker)), &sudo())?;
        } else {
            session.run_capture(&format!("service {} stop", name), &sudo())?;
        }
        session.run_capture(&format!("rm -f {}", quote(&self.stamp())), &sudo())?;
        Ok(())
    }

    fn finish(&self, session: &mut dyn Session) -> Result<()> {
        session.run_capture(&format!("rm -f {}", quote(&self.marker())), &sudo())?;
        Ok(())
    }
}
