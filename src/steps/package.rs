//! System and language package steps (apt, pip, gem)

use anyhow::Result;
use declarative::{RunOptions, Session, Step};
use std::collections::BTreeSet;

use super::{names, quote, sudo};

/// Package manager that owns a package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manager {
    Apt,
    Pip,
    Gem,
}

impl Manager {
    pub fn label(self) -> &'static str {
        match self {
            Self::Apt => "apt",
            Self::Pip => "pip",
            Self::Gem => "gem",
        }
    }
}

/// One or more packages that must be installed
#[derive(Debug, Clone)]
pub struct Package {
    id: String,
    manager: Manager,
    packages: Vec<String>,
    upgrade: bool,
    removable: bool,
    after: Vec<String>,
}

impl Package {
    fn new<I, S>(manager: Manager, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let packages = names(packages);
        Self {
            id: format!("package:{}", packages.join(",")),
            manager,
            packages,
            upgrade: false,
            removable: false,
            after: Vec::new(),
        }
    }

    pub fn apt<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Manager::Apt, packages)
    }

    pub fn pip<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Manager::Pip, packages)
    }

    pub fn gem<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Manager::Gem, packages)
    }

    /// Replace the default `package:<names>` id
    pub fn named(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// pip only: also require the newest version
    pub fn upgrade(mut self) -> Self {
        self.upgrade = true;
        self
    }

    /// Remove the packages again on rollback
    pub fn removable(mut self) -> Self {
        self.removable = true;
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

    pub fn manager(&self) -> Manager {
        self.manager
    }

    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    fn apt_opts() -> RunOptions {
        sudo().with_env("DEBIAN_FRONTEND", "noninteractive")
    }

    fn quoted(packages: &[String]) -> String {
        packages
            .iter()
            .map(|p| quote(p))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Packages that are not installed yet
    fn missing(&self, session: &mut dyn Session) -> Result<Vec<String>> {
        match self.manager {
            Manager::Apt => {
                // dpkg-query exits non-zero for unknown names but still lists the rest
                let output = session.run(
                    &format!(
                        "dpkg-query -W -f '${{Package}} ${{Status}}\\n' {}",
                        Self::quoted(&self.packages)
                    ),
                    &sudo(),
                )?;
                let installed: BTreeSet<String> = output
                    .stdout_str()
                    .lines()
                    .filter(|l| l.ends_with("install ok installed"))
                    .filter_map(|l| l.split_whitespace().next().map(String::from))
                    .collect();
                Ok(self
                    .packages
                    .iter()
                    .filter(|p| !installed.contains(p.as_str()))
                    .cloned()
                    .collect())
            }
            Manager::Pip => {
                let mut missing = Vec::new();
                for package in &self.packages {
                    if !session.run_status(&format!("pip show {}", quote(package)), &sudo())? {
                        missing.push(package.clone());
                    }
                }
                if self.upgrade && missing.len() < self.packages.len() {
                    let outdated = session.run_capture(
                        "pip list --outdated --format=freeze",
                        &sudo(),
                    )?;
                    for line in outdated.lines() {
                        let name = line.split("==").next().unwrap_or_default();
                        if let Some(package) = self
                            .packages
                            .iter()
                            .find(|p| p.eq_ignore_ascii_case(name) && !missing.contains(p))
                        {
                            missing.push(package.clone());
                        }
                    }
                }
                Ok(missing)
            }
            Manager::Gem => {
                let mut missing = Vec::new();
                for package in &self.packages {
                    let pattern = format!("^{}$", package);
                    if !session.run_status(&format!("gem list -i {}", quote(&pattern)), &sudo())? {
                        missing.push(package.clone());
                    }
                }
                Ok(missing)
            }
        }
    }
}

impl Step for Package {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "package"
    }

    fn description(&self) -> String {
        format!(
            "{} {} ({})",
            if self.upgrade { "Upgrade" } else { "Install" },
            self.packages.join(", "),
            self.manager.label()
        )
    }

    fn prerequisites(&self) -> &[String] {
        &self.after
    }

    fn check(&self, session: &mut dyn Session) -> Result<bool> {
        Ok(self.missing(session)?.is_empty())
    }

    fn apply(&self, session: &mut dyn Session) -> Result<()> {
        let missing = self.missing(session)?;
        if missing.is_empty() {
            return Ok(());
        }
        log::info!("[{}] installing {}", session.host(), missing.join(" "));

        let packages = Self::quoted(&missing);
        match self.manager {
            Manager::Apt => {
                session.run_capture(
                    &format!("apt-get install -y -q {}", packages),
                    &Self::apt_opts(),
                )?;
            }
            Manager::Pip => {
                let flag = if self.upgrade { "-U " } else { "" };
                session.run_capture(&format!("pip install {}{}", flag, packages), &sudo())?;
            }
            Manager::Gem => {
                session.run_capture(&format!("gem install --no-document {}", packages), &sudo())?;
            }
        }
        Ok(())
    }

    fn supports_undo(&self) -> bool {
        self.removable
    }

    fn undo(&self, session: &mut dyn Session) -> Result<()> {
        let packages = Self::quoted(&self.packages);
        let (command, opts) = match self.manager {
            Manager::Apt => (format!("apt-get remove -y -q {}", packages), Self::apt_opts()),
            Manager::Pip => (format!("pip uninstall -y {}", packages), sudo()),
            Manager::Gem => (format!("gem uninstall -a -x {}", packages), sudo()),
        };
        session.run_capture(&command, &opts)?;
        Ok(())
    }
}
