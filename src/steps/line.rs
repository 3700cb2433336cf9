//! Single line in a text file
//!
//! Ensures `line` is present in `file`, either by rewriting the line that
//! matches `pattern` or by appending it. The file as it was is kept under
//! [`BACKUP_DIR`](super::BACKUP_DIR) until the run completes, so undo puts a
//! rewritten line back as well.

use anyhow::{Result, bail};
use declarative::{PutOptions, Session, Step};

use super::{back_up, backup_path, discard, exists, names, quote, restore, sudo};

/// Delimiters tried, in order, for sed expressions
const DELIMITERS: [char; 7] = ['/', '|', '#', '%', '@', ',', '~'];

#[derive(Debug, Clone)]
pub struct Line {
    id: String,
    file: String,
    line: String,
    pattern: Option<String>,
    after: Vec<String>,
}

impl Line {
    pub fn new(file: impl Into<String>, line: impl Into<String>) -> Self {
        let file = file.into();
        let line = line.into();
        Self {
            id: format!("line:{}:{}", file, line),
            file,
            line,
            pattern: None,
            after: Vec::new(),
        }
    }

    pub fn named(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Rewrite lines matching this extended regex instead of appending
    pub fn replacing(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
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

    fn delimiter(&self, extra: &str) -> Result<char> {
        match DELIMITERS
            .into_iter()
            .find(|d| !self.line.contains(*d) && !extra.contains(*d))
        {
            Some(d) => Ok(d),
            None => bail!("no usable sed delimiter for line {:?}", self.line),
        }
    }

    fn sed(&self, session: &mut dyn Session, expression: &str, extended: bool) -> Result<()> {
        let flag = if extended { "-E " } else { "" };
        session.run_capture(
            &format!(
                "sed -i {}-e {} {}",
                flag,
                quote(expression),
                quote(&self.file)
            ),
            &sudo(),
        )?;
        Ok(())
    }
}

/// Escape a literal for a POSIX extended regex
fn escape_ere(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if ".[]()*+?{}|^$\\".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape a literal for the replacement side of `s///`
fn escape_replacement(text: &str, delimiter: char) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\\' || c == '&' || c == delimiter {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl Step for Line {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "line"
    }

    fn description(&self) -> String {
        format!("Ensure {:?} in {}", self.line, self.file)
    }

    fn prerequisites(&self) -> &[String] {
        &self.after
    }

    fn check(&self, session: &mut dyn Session) -> Result<bool> {
        session.run_status(
            &format!("grep -qxF -- {} {}", quote(&self.line), quote(&self.file)),
            &sudo(),
        )
    }

    fn apply(&self, session: &mut dyn Session) -> Result<()> {
        if self.line.contains('\n') {
            bail!("{} must be a single line", self.id);
        }
        back_up(session, &self.file, &backup_path(&self.id))?;

        if let Some(pattern) = &self.pattern {
            let matched = session.run_status(
                &format!("grep -qE -- {} {}", quote(pattern), quote(&self.file)),
                &sudo(),
            )?;
            if matched {
                let d = self.delimiter(pattern)?;
                let expression = format!(
                    "s{d}{}{d}{}{d}",
                    pattern,
                    escape_replacement(&self.line, d)
                );
                return self.sed(session, &expression, true);
            }
        }

        let non_empty = session.run_status(&format!("test -s {}", quote(&self.file)), &sudo())?;
        if non_empty {
            let expression = format!("$a\\{}", self.line.replace('\\', "\\\\"));
            return self.sed(session, &expression, false);
        }

        session.put_file(
            format!("{}\n", self.line).as_bytes(),
            &self.file,
            &PutOptions::sudo(),
        )?;
        Ok(())
    }

    fn supports_undo(&self) -> bool {
        true
    }

    /// Restores the backup; without one, removes the line
    fn undo(&self, session: &mut dyn Session) -> Result<()> {
        if restore(session, &self.file, &backup_path(&self.id))? {
            return Ok(());
        }
        if !exists(session, &self.file, &sudo())? {
            return Ok(());
        }
        let d = self.delimiter("")?;
        let expression = format!("\\{d}^{}${d}d", escape_ere(&self.line));
        self.sed(session, &expression, true)
    }

    fn finish(&self, session: &mut dyn Session) -> Result<()> {
        discard(session, &backup_path(&self.id))
    }
}
