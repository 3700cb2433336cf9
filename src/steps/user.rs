//! Local user account step

use anyhow::Result;
use declarative::{Session, Step};

use super::{names, quote, sudo};

#[derive(Debug, Clone)]
pub struct User {
    id: String,
    name: String,
    system: bool,
    after: Vec<String>,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: format!("user:{}", name),
            name,
            system: false,
            after: Vec::new(),
        }
    }

    /// Create a system account
    pub fn system(mut self) -> Self {
        self.system = true;
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
}

impl Step for User {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "user"
    }

    fn description(&self) -> String {
        format!("Create user {}", self.name)
    }

    fn prerequisites(&self) -> &[String] {
        &self.after
    }

    fn check(&self, session: &mut dyn Session) -> Result<bool> {
        session.run_status(&format!("id -u {}", quote(&self.name)), &sudo())
    }

    fn apply(&self, session: &mut dyn Session) -> Result<()> {
        let system = if self.system { " --system" } else { "" };
        session.run_capture(
            &format!(
                "adduser --gecos '' --disabled-password --quiet{} {}",
                system,
                quote(&self.name)
            ),
            &sudo(),
        )?;
        Ok(())
    }

    fn supports_undo(&self) -> bool {
        true
    }

    fn undo(&self, session: &mut dyn Session) -> Result<()> {
        session.run_capture(&format!("deluser {}", quote(&self.name)), &sudo())?;
        Ok(())
    }
}
