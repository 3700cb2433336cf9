//! Git checkout step

use anyhow::{Result, bail};
use declarative::{Session, Step};

use super::{exists, names, quote, sudo};

#[derive(Debug, Clone)]
pub struct GitCheckout {
    id: String,
    url: String,
    dest: String,
    branch: Option<String>,
    after: Vec<String>,
}

impl GitCheckout {
    pub fn new(url: impl Into<String>, dest: impl Into<String>) -> Self {
        let dest = dest.into();
        Self {
            id: format!("git:{}", dest),
            url: url.into(),
            dest,
            branch: None,
            after: Vec::new(),
        }
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
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

    /// `git` scoped to the checkout; root may not own the directory
    fn git(&self, args: &str) -> String {
        format!(
            "git -c {} -C {} {}",
            quote(&format!("safe.directory={}", self.dest)),
            quote(&self.dest),
            args
        )
    }

    fn origin(&self, session: &mut dyn Session) -> Result<Option<String>> {
        let output = session.run(&self.git("config --get remote.origin.url"), &sudo())?;
        Ok(output
            .success()
            .then(|| output.stdout_str().trim().to_string()))
    }

    fn current_branch(&self, session: &mut dyn Session) -> Result<Option<String>> {
        let output = session.run(&self.git("rev-parse --abbrev-ref HEAD"), &sudo())?;
        Ok(output
            .success()
            .then(|| output.stdout_str().trim().to_string()))
    }
}

impl Step for GitCheckout {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "git"
    }

    fn description(&self) -> String {
        match &self.branch {
            Some(branch) => format!("Check out {} ({}) into {}", self.url, branch, self.dest),
            None => format!("Check out {} into {}", self.url, self.dest),
        }
    }

    fn prerequisites(&self) -> &[String] {
        &self.after
    }

    fn check(&self, session: &mut dyn Session) -> Result<bool> {
        if self.origin(session)?.as_deref() != Some(self.url.as_str()) {
            return Ok(false);
        }
        match &self.branch {
            Some(branch) => Ok(self.current_branch(session)?.as_deref() == Some(branch.as_str())),
            None => Ok(true),
        }
    }

    fn apply(&self, session: &mut dyn Session) -> Result<()> {
        if !exists(session, &self.dest, &sudo())? {
            let branch = self
                .branch
                .as_deref()
                .map(|b| format!("-b {} ", quote(b)))
                .unwrap_or_default();
            session.run_capture(
                &format!("git clone {}{} {}", branch, quote(&self.url), quote(&self.dest)),
                &sudo(),
            )?;
            return Ok(());
        }

        match self.origin(session)? {
            Some(origin) if origin == self.url => {
                if let Some(branch) = &self.branch {
                    session.run_capture(&self.git(&format!("checkout {}", quote(branch))), &sudo())?;
                }
                Ok(())
            }
            Some(origin) => bail!(
                "{} is a checkout of {}, not {}; refusing to replace it",
                self.dest,
                origin,
                self.url
            ),
            None => bail!(
                "{} exists and is not a git checkout; refusing to replace it",
                self.dest
            ),
        }
    }
}
