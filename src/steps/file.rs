//! Rendered file step
//!
//! Content is compared by SHA-256 so an unchanged file is never re-uploaded.
//! The previous version is kept under [`BACKUP_DIR`](super::BACKUP_DIR)
//! until the run completes or is rolled back.

use anyhow::{Context, Result};
use declarative::{PutOptions, Session, Step};
use sha2::{Digest, Sha256};

use super::{back_up, backup_path, discard, names, quote, restore, stat, sudo};

#[derive(Debug, Clone)]
pub struct RemoteFile {
    id: String,
    path: String,
    content: Vec<u8>,
    mode: Option<u32>,
    owner: Option<String>,
    after: Vec<String>,
}

impl RemoteFile {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        let path = path.into();
        Self {
            id: format!("file:{}", path),
            path,
            content: content.into(),
            mode: None,
            owner: None,
            after: Vec::new(),
        }
    }

    pub fn named(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// `user` or `user:group`
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
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

    pub fn path(&self) -> &str {
        &self.path
    }

    fn digest(&self) -> String {
        Sha256::digest(&self.content)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    fn remote_digest(&self, session: &mut dyn Session) -> Result<Option<String>> {
        let output = session.run(&format!("sha256sum {}", quote(&self.path)), &sudo())?;
        if !output.success() {
            return Ok(None);
        }
        Ok(output
            .stdout_str()
            .split_whitespace()
            .next()
            .map(str::to_lowercase))
    }
}

impl Step for RemoteFile {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "file"
    }

    fn description(&self) -> String {
        format!("Write {}", self.path)
    }

    fn prerequisites(&self) -> &[String] {
        &self.after
    }

    fn check(&self, session: &mut dyn Session) -> Result<bool> {
        if self.remote_digest(session)?.as_deref() != Some(self.digest().as_str()) {
            return Ok(false);
        }
        if self.mode.is_none() && self.owner.is_none() {
            return Ok(true);
        }

        let Some(stat) = stat(session, &self.path)? else {
            return Ok(false);
        };
        Ok(self.mode.is_none_or(|m| stat.mode == m)
            && self.owner.as_deref().is_none_or(|o| stat.owned_by(o)))
    }

    fn apply(&self, session: &mut dyn Session) -> Result<()> {
        back_up(session, &self.path, &backup_path(&self.id))?;

        let opts = PutOptions {
            sudo: true,
            mode: self.mode,
            owner: self.owner.clone(),
        };
        session
            .put_file(&self.content, &self.path, &opts)
            .with_context(|| format!("Failed to write {}", self.path))?;
        Ok(())
    }

    fn supports_undo(&self) -> bool {
        true
    }

    fn undo(&self, session: &mut dyn Session) -> Result<()> {
        if !restore(session, &self.path, &backup_path(&self.id))? {
            discard(session, &self.path)?;
        }
        Ok(())
    }

    fn finish(&self, session: &mut dyn Session) -> Result<()> {
        discard(session, &backup_path(&self.id))
    }
}
