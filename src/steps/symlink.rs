//! Symbolic link step

use anyhow::Result;
use declarative::{Session, Step};

use super::{names, quote, sudo};

#[derive(Debug, Clone)]
pub struct Symlink {
    id: String,
    link: String,
    target: String,
    after: Vec<String>,
}

impl Symlink {
    /// `link` pointing at `target`
    pub fn new(link: impl Into<String>, target: impl Into<String>) -> Self {
        let link = link.into();
        Self {
            id: format!("symlink:{}", link),
            link,
            target: target.into(),
            after: Vec::new(),
        }
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

impl Step for Symlink {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "symlink"
    }

    fn description(&self) -> String {
        format!("Link {} -> {}", self.link, self.target)
    }

    fn prerequisites(&self) -> &[String] {
        &self.after
    }

    fn check(&self, session: &mut dyn Session) -> Result<bool> {
        let output = session.run(&format!("readlink {}", quote(&self.link)), &sudo())?;
        Ok(output.success() && output.stdout_str().trim_end_matches('\n') == self.target)
    }

    fn apply(&self, session: &mut dyn Session) -> Result<()> {
        session.run_capture(
            &format!("ln -sfn {} {}", quote(&self.target), quote(&self.link)),
            &sudo(),
        )?;
        Ok(())
    }

    fn supports_undo(&self) -> bool {
        true
    }

    fn undo(&self, session: &mut dyn Session) -> Result<()> {
        session.run_capture(&format!("rm -f {}", quote(&self.link)), &sudo())?;
        Ok(())
    }
}
