//! Built-in provisioning steps for Debian-style hosts
//!
//! Every step here checks with a cheap read-only command and converges with
//! plain coreutils, package manager or init-system commands run under sudo.

pub mod command;
pub mod directory;
pub mod file;
pub mod git;
pub mod line;
pub mod package;
pub mod service;
pub mod symlink;
pub mod user;

pub use command::{Exec, Guard};
pub use directory::Directory;
pub use file::RemoteFile;
pub use git::GitCheckout;
pub use line::Line;
pub use package::{Manager, Package};
pub use service::Service;
pub use symlink::Symlink;
pub use user::User;

pub(crate) use crate::session::quote;

use anyhow::{Context, Result};
use declarative::{RunOptions, Session};

/// Where stamps for restarts and one-shot commands are kept
pub const STATE_DIR: &str = "/var/lib/stackup";

/// Previous versions of files changed by `file` and `line` steps.
///
/// Kept away from the targets so config include globs never pick them up.
pub const BACKUP_DIR: &str = "/var/lib/stackup/backup";

/// Options for a privileged check or mutation
pub(crate) fn sudo() -> RunOptions {
    RunOptions::sudo()
}

/// Collect step names from a builder argument
pub(crate) fn names<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Mode and ownership of a remote path
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Stat {
    pub mode: u32,
    pub user: String,
    pub group: String,
}

impl Stat {
    fn parse(text: &str) -> Result<Self> {
        let mut fields = text.split_whitespace();
        let (Some(mode), Some(user), Some(group)) = (fields.next(), fields.next(), fields.next())
        else {
            anyhow::bail!("unexpected stat output: {:?}", text.trim());
        };
        Ok(Self {
            mode: u32::from_str_radix(mode, 8)
                .with_context(|| format!("invalid mode in stat output: {}", mode))?,
            user: user.to_string(),
            group: group.to_string(),
        })
    }

    /// Whether `owner` (`user` or `user:group`) matches
    pub fn owned_by(&self, owner: &str) -> bool {
        match owner.split_once(':') {
            Some((user, group)) => self.user == user && self.group == group,
            None => self.user == owner,
        }
    }
}

/// `stat` a remote path; `None` when it does not exist
pub(crate) fn stat(session: &mut dyn Session, path: &str) -> Result<Option<Stat>> {
    let output = session.run(&format!("stat -c '%a %U %G' {}", quote(path)), &sudo())?;
    if !output.success() {
        return Ok(None);
    }
    Stat::parse(&output.stdout_str()).map(Some)
}

/// Backup location for the step `id`, one flat file per step
pub(crate) fn backup_path(id: &str) -> String {
    format!("{}/{}", BACKUP_DIR, id.replace('%', "%25").replace('/', "%2F"))
}

/// Copy `path` to `backup` before changing it.
///
/// Returns whether there was anything to keep; a stale backup from an
/// earlier run is dropped so it can never be restored over a new file.
pub(crate) fn back_up(session: &mut dyn Session, path: &str, backup: &str) -> Result<bool> {
    session.run_capture(&format!("mkdir -p {}", quote(BACKUP_DIR)), &sudo())?;
    if exists(session, path, &sudo())? {
        session.run_capture(&format!("cp -p {} {}", quote(path), quote(backup)), &sudo())?;
        Ok(true)
    } else {
        session.run_capture(&format!("rm -f {}", quote(backup)), &sudo())?;
        Ok(false)
    }
}

/// Move `backup` back over `path`; `false` when there is no backup
pub(crate) fn restore(session: &mut dyn Session, path: &str, backup: &str) -> Result<bool> {
    if !exists(session, backup, &sudo())? {
        return Ok(false);
    }
    session.run_capture(&format!("mv -f {} {}", quote(backup), quote(path)), &sudo())?;
    Ok(true)
}

pub(crate) fn discard(session: &mut dyn Session, path: &str) -> Result<()> {
    session.run_capture(&format!("rm -f {}", quote(path)), &sudo())?;
    Ok(())
}

/// Whether a remote path exists
pub(crate) fn exists(session: &mut dyn Session, path: &str, opts: &RunOptions) -> Result<bool> {
    session.run_status(&format!("test -e {}", quote(path)), opts)
}
