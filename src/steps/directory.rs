//! Directory step with optional ownership and mode
//!
//! Recursive directories take a symbolic mode (`u+rwX,g+rwX,o-rw`) that is
//! applied with `chmod -R` and checked with `find`, so files below the root
//! are held to it as well.

use anyhow::{Result, bail};
use declarative::{Session, Step};

use super::{names, quote, stat, sudo};

#[derive(Debug, Clone)]
pub struct Directory {
    id: String,
    path: String,
    owner: Option<String>,
    mode: Option<u32>,
    permissions: Option<String>,
    recursive: bool,
    after: Vec<String>,
}

impl Directory {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            id: format!("directory:{}", path),
            path,
            owner: None,
            mode: None,
            permissions: None,
            recursive: false,
            after: Vec::new(),
        }
    }

    pub fn named(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// `user` or `user:group`
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Symbolic `chmod` mode made of `+` and `-` clauses, e.g. `o-rw`
    pub fn permissions(mut self, mode: impl Into<String>) -> Self {
        self.permissions = Some(mode.into());
        self
    }

    /// Apply ownership and permissions to everything below as well
    pub fn recursive(mut self) -> Self {
        self.recursive = true;
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

    fn permissions_hold(&self, session: &mut dyn Session) -> Result<bool> {
        let Some(permissions) = &self.permissions else {
            return Ok(true);
        };
        for predicates in permission_violations(permissions)? {
            if self.finds(session, &predicates)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether `find` matches anything for `predicates`
    fn finds(&self, session: &mut dyn Session, predicates: &str) -> Result<bool> {
        let depth = if self.recursive { "" } else { " -maxdepth 0" };
        let found = session.run_capture(
            &format!(
                "find {}{} {} -print -quit",
                quote(&self.path),
                depth,
                predicates
            ),
            &sudo(),
        )?;
        Ok(!found.trim().is_empty())
    }
}

/// `find` predicates matching anything that violates the symbolic `mode`.
///
/// `+` clauses flag entries missing a bit, `-` clauses entries that still
/// have one. `X` only concerns directories. Symlinks are never chmod'ed and
/// are skipped.
fn permission_violations(mode: &str) -> Result<Vec<String>> {
    let mut violations = Vec::new();
    for clause in mode.split(',') {
        let Some(at) = clause.find(['+', '-']) else {
            bail!("unsupported mode clause {:?} in {:?}", clause, mode);
        };
        let (who, rest) = clause.split_at(at);
        let (op, perms) = rest.split_at(1);
        if who.is_empty()
            || !who.chars().all(|c| "ugoa".contains(c))
            || perms.is_empty()
            || !perms.chars().all(|c| "rwxX".contains(c))
        {
            bail!("unsupported mode clause {:?} in {:?}", clause, mode);
        }

        if op == "+" {
            let plain: String = perms.chars().filter(|c| *c != 'X').collect();
            if !plain.is_empty() {
                violations.push(format!("! -type l ! -perm -{}={}", who, plain));
            }
            if perms.contains('X') {
                violations.push(format!("-type d ! -perm -{}=x", who));
            }
        } else {
            let bits: String = ['r', 'w', 'x']
                .into_iter()
                .filter(|c| perms.contains(*c) || (*c == 'x' && perms.contains('X')))
                .collect();
            violations.push(format!("! -type l -perm /{}={}", who, bits));
        }
    }
    Ok(violations)
}

impl Step for Directory {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "directory"
    }

    fn description(&self) -> String {
        match &self.owner {
            Some(owner) => format!("Create {} owned by {}", self.path, owner),
            None => format!("Create {}", self.path),
        }
    }

    fn prerequisites(&self) -> &[String] {
        &self.after
    }

    fn check(&self, session: &mut dyn Session) -> Result<bool> {
        let Some(stat) = stat(session, &self.path)? else {
            return Ok(false);
        };
        if self.mode.is_some_and(|m| stat.mode != m) {
            return Ok(false);
        }
        let Some(owner) = &self.owner else {
            return self.permissions_hold(session);
        };
        if !stat.owned_by(owner) {
            return Ok(false);
        }

        if self.recursive {
            let (user, group) = owner
                .split_once(':')
                .map_or((owner.as_str(), None), |(u, g)| (u, Some(g)));
            if self.finds(session, &format!("! -user {}", quote(user)))? {
                return Ok(false);
            }
            if let Some(group) = group
                && self.finds(session, &format!("! -group {}", quote(group)))?
            {
                return Ok(false);
            }
        }
        self.permissions_hold(session)
    }

    fn apply(&self, session: &mut dyn Session) -> Result<()> {
        let path = quote(&self.path);
        session.run_capture(&format!("mkdir -p {}", path), &sudo())?;

        if let Some(owner) = &self.owner {
            let flag = if self.recursive { "-R " } else { "" };
            session.run_capture(&format!("chown {}{} {}", flag, quote(owner), path), &sudo())?;
        }
        if let Some(mode) = self.mode {
            session.run_capture(&format!("chmod {:o} {}", mode, path), &sudo())?;
        }
        if let Some(permissions) = &self.permissions {
            // Unsupported clauses fail here, before chmod sees them
            permission_violations(permissions)?;
            let flag = if self.recursive { "-R " } else { "" };
            session.run_capture(
                &format!("chmod {}{} {}", flag, quote(permissions), path),
                &sudo(),
            )?;
        }
        Ok(())
    }

    fn supports_undo(&self) -> bool {
        true
    }

    fn undo(&self, session: &mut dyn Session) -> Result<()> {
        session.run_capture(
            &format!("rmdir --ignore-fail-on-non-empty {}", quote(&self.path)),
            &sudo(),
        )?;
        Ok(())
    }
}
