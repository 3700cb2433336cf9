//! In-memory Debian-like host for step and role tests
//!
//! Understands the small command vocabulary the built-in steps issue
//! (package managers, coreutils, `service`, `git`, `grep`, `sed`) and keeps
//! a file tree with modes, owners and a logical mtime clock.

use declarative::{CommandOutput, PutOptions, RunOptions, Session, SessionError};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    File(Vec<u8>),
    Dir,
    Link(String),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub mode: u32,
    pub user: String,
    pub group: String,
    pub mtime: u64,
}

#[derive(Debug, Default)]
pub struct SimHost {
    pub nodes: BTreeMap<String, Node>,
    /// Installed packages per manager ("apt", "pip", "gem")
    pub packages: BTreeMap<String, BTreeSet<String>>,
    /// Known services and whether they are running
    pub services: BTreeMap<String, bool>,
    pub users: BTreeSet<String>,
    /// Checkout path -> (origin url, branch)
    pub repos: BTreeMap<String, (String, String)>,
    /// Every command and upload, in order
    pub log: Vec<String>,
    /// Commands starting with one of these exit 1
    pub failing: BTreeSet<String>,
    /// Remaining dropped-connection failures per exact command
    pub dropped: BTreeMap<String, u32>,
    /// Files created as a side effect of commands starting with the key
    pub effects: BTreeMap<String, Vec<String>>,
    /// Files (relative path, content) present in a fresh clone of a url
    pub checkouts: BTreeMap<String, Vec<(String, String)>>,
    /// Unknown programs succeed instead of exiting 127
    pub permissive: bool,
    pub clock: u64,
    pub closes: u32,
}

fn ok(stdout: impl Into<Vec<u8>>) -> CommandOutput {
    CommandOutput::new(0, stdout, "")
}

fn fail(code: i32, stderr: impl Into<Vec<u8>>) -> CommandOutput {
    CommandOutput::new(code, "", stderr)
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parent(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(i) => Some(path[..i].to_string()),
        None => None,
    }
}

fn split_owner(owner: &str) -> (String, Option<String>) {
    match owner.split_once([':', '.']) {
        Some((user, group)) => (user.to_string(), Some(group.to_string())),
        None => (owner.to_string(), None),
    }
}

/// Split leading `-x` style flags from operands (honouring `--`)
fn flags_and_operands(args: &[String]) -> (Vec<&str>, Vec<&str>) {
    let mut flags = Vec::new();
    let mut operands = Vec::new();
    let mut only_operands = false;
    for arg in args {
        if only_operands {
            operands.push(arg.as_str());
        } else if arg == "--" {
            only_operands = true;
        } else if arg.starts_with('-') && arg.len() > 1 {
            flags.push(arg.as_str());
        } else {
            operands.push(arg.as_str());
        }
    }
    (flags, operands)
}

impl SimHost {
    pub fn new() -> Self {
        let mut host = Self::default();
        for dir in [
            "/", "/etc", "/home", "/opt", "/root", "/tmp", "/usr", "/usr/bin", "/usr/local",
            "/usr/local/bin", "/usr/share", "/var", "/var/lib", "/var/log", "/var/run",
        ] {
            host.mkdir_p(dir);
        }
        host.users.insert("root".to_string());
        host.users.insert("www-data".to_string());
        host
    }

    pub fn shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new()))
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(&normalize(path))
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        match self.nodes.get(&normalize(path)).map(|n| &n.kind) {
            Some(NodeKind::File(content)) => Some(content),
            _ => None,
        }
    }

    pub fn file_text(&self, path: &str) -> Option<String> {
        self.file(path)
            .map(|c| String::from_utf8_lossy(c).into_owned())
    }

    pub fn node(&self, path: &str) -> Option<&Node> {
        self.nodes.get(&normalize(path))
    }

    pub fn is_installed(&self, manager: &str, name: &str) -> bool {
        self.packages
            .get(manager)
            .is_some_and(|set| set.contains(name))
    }

    /// Number of logged commands starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.log.iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn mkdir_p(&mut self, path: &str) {
        let path = normalize(path);
        let mut current = String::new();
        let mut to_create = vec!["/".to_string()];
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            to_create.push(current.clone());
        }
        for dir in to_create {
            if !self.nodes.contains_key(&dir) {
                let mtime = self.tick();
                self.nodes.insert(
                    dir,
                    Node {
                        kind: NodeKind::Dir,
                        mode: 0o755,
                        user: "root".to_string(),
                        group: "root".to_string(),
                        mtime,
                    },
                );
            }
        }
    }

    /// Create or replace a file; the parent must exist
    pub fn write_file(&mut self, path: &str, content: &[u8]) -> bool {
        let path = normalize(path);
        if !parent(&path).is_some_and(|p| self.is_dir(&p)) {
            return false;
        }
        let mtime = self.tick();
        let node = self.nodes.entry(path).or_insert_with(|| Node {
            kind: NodeKind::Dir,
            mode: 0o644,
            user: "root".to_string(),
            group: "root".to_string(),
            mtime,
        });
        node.kind = NodeKind::File(content.to_vec());
        node.mtime = mtime;
        true
    }

    fn is_dir(&self, path: &str) -> bool {
        matches!(
            self.nodes.get(path).map(|n| &n.kind),
            Some(NodeKind::Dir)
        )
    }

    fn children_prefix(path: &str) -> String {
        if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        }
    }

    fn subtree(&self, path: &str) -> Vec<String> {
        let prefix = Self::children_prefix(path);
        let mut paths = vec![path.to_string()];
        paths.extend(
            self.nodes
                .keys()
                .filter(|k| k.starts_with(&prefix) && k.as_str() != path)
                .cloned(),
        );
        paths
    }

    fn remove_tree(&mut self, path: &str) {
        for p in self.subtree(path) {
            self.nodes.remove(&p);
        }
    }

    fn abs(cwd: Option<&str>, path: &str) -> String {
        if path.starts_with('/') {
            normalize(path)
        } else {
            match cwd {
                Some(dir) => normalize(&format!("{}/{}", normalize(dir), path)),
                None => normalize(&format!("/root/{}", path)),
            }
        }
    }

    fn install_package(&mut self, manager: &str, name: &str) {
        self.packages
            .entry(manager.to_string())
            .or_default()
            .insert(name.to_string());
        if manager != "apt" {
            return;
        }

        match name {
            "nginx" => {
                self.mkdir_p("/etc/nginx/sites-available");
                self.mkdir_p("/etc/nginx/sites-enabled");
                self.write_file("/etc/nginx/sites-available/default", b"server {}\n");
                self.link(
                    "/etc/nginx/sites-enabled/default",
                    "/etc/nginx/sites-available/default",
                );
                self.services.insert("nginx".to_string(), true);
            }
            "uwsgi" => {
                self.mkdir_p("/etc/uwsgi/apps-available");
                self.mkdir_p("/etc/uwsgi/apps-enabled");
                self.mkdir_p("/usr/share/uwsgi/conf");
                self.write_file(
                    "/usr/share/uwsgi/conf/default.ini",
                    b"[uwsgi]\nuid = www-data\ngid = www-data\n",
                );
                self.services.insert("uwsgi".to_string(), true);
            }
            "monit" => {
                self.mkdir_p("/etc/monit/conf.d");
                self.services.insert("monit".to_string(), true);
            }
            "upstart" => self.mkdir_p("/etc/init"),
            "memcached" => {
                self.services.insert("memcached".to_string(), true);
            }
            _ => {}
        }
    }

    fn link(&mut self, link: &str, target: &str) {
        let mtime = self.tick();
        self.nodes.insert(
            normalize(link),
            Node {
                kind: NodeKind::Link(target.to_string()),
                mode: 0o777,
                user: "root".to_string(),
                group: "root".to_string(),
                mtime,
            },
        );
    }

    /// Execute one command line
    pub fn exec(&mut self, command: &str, opts: &RunOptions) -> Result<CommandOutput, SessionError> {
        self.log.push(command.to_string());

        if let Some(remaining) = self.dropped.get_mut(command)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(SessionError::Command {
                command: command.to_string(),
                message: "Connection reset by peer".to_string(),
                transient: true,
            });
        }

        if self.failing.iter().any(|p| command.starts_with(p.as_str())) {
            return Ok(fail(1, format!("{}: forced failure", command)));
        }

        let effect = self
            .effects
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, paths)| paths.clone());
        if let Some(paths) = effect {
            for path in paths {
                let path = Self::abs(opts.cwd.as_deref(), &path);
                if let Some(dir) = parent(&path) {
                    self.mkdir_p(&dir);
                }
                self.write_file(&path, b"");
            }
            return Ok(ok(""));
        }

        let (negate, line) = match command.strip_prefix("! ") {
            Some(rest) => (true, rest),
            None => (false, command),
        };

        let Some(words) = shlex::split(line) else {
            return Ok(fail(2, "sh: syntax error"));
        };
        let Some((program, args)) = words.split_first() else {
            return Ok(ok(""));
        };

        let output = self.dispatch(program, args, opts.cwd.as_deref());
        if negate {
            let code = i32::from(output.success());
            return Ok(CommandOutput { exit_code: Some(code), ..output });
        }
        Ok(output)
    }

    fn dispatch(&mut self, program: &str, args: &[String], cwd: Option<&str>) -> CommandOutput {
        match program {
            "true" => ok(""),
            "false" => fail(1, ""),
            "dpkg-query" => self.dpkg_query(args),
            "apt-get" => self.apt_get(args),
            "apt-add-repository" => ok(""),
            "pip" => self.pip(args),
            "gem" => self.gem(args),
            "sha256sum" => self.sha256sum(args, cwd),
            "stat" => self.stat(args, cwd),
            "test" => self.test(args, cwd),
            "cat" => self.cat(args, cwd),
            "cp" => self.cp(args, cwd),
            "mv" => self.mv(args, cwd),
            "rm" => self.rm(args, cwd),
            "rmdir" => self.rmdir(args, cwd),
            "mkdir" => {
                let (_, operands) = flags_and_operands(args);
                for dir in operands {
                    self.mkdir_p(&Self::abs(cwd, dir));
                }
                ok("")
            }
            "touch" => self.touch(args, cwd),
            "chown" => self.chown(args, cwd),
            "chmod" => self.chmod(args, cwd),
            "service" => self.service(args),
            "id" => self.id(args),
            "adduser" => {
                let (_, operands) = flags_and_operands(args);
                // `--gecos ""` leaves an empty operand before the name
                match operands.iter().rev().find(|o| !o.is_empty()) {
                    Some(name) => {
                        self.users.insert((*name).to_string());
                        ok("")
                    }
                    None => fail(1, "adduser: no user name"),
                }
            }
            "deluser" => {
                let (_, operands) = flags_and_operands(args);
                match operands.first() {
                    Some(name) if self.users.remove(*name) => ok(""),
                    _ => fail(2, "deluser: no such user"),
                }
            }
            "readlink" => self.readlink(args, cwd),
            "ln" => self.ln(args, cwd),
            "grep" => self.grep(args, cwd),
            "sed" => self.sed(args, cwd),
            "git" => self.git(args, cwd),
            "find" => self.find(args, cwd),
            _ if self.permissive => ok(""),
            _ => fail(127, format!("{}: command not found", program)),
        }
    }

    fn dpkg_query(&self, args: &[String]) -> CommandOutput {
        let mut names = Vec::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-f" => {
                    iter.next();
                }
                a if a.starts_with('-') => {}
                name => names.push(name),
            }
        }

        let mut stdout = String::new();
        let mut missing = Vec::new();
        for name in names {
            if self.is_installed("apt", name) {
                let _ = writeln!(stdout, "{} install ok installed", name);
            } else {
                missing.push(name);
            }
        }

        if missing.is_empty() {
            ok(stdout)
        } else {
            CommandOutput::new(
                1,
                stdout,
                format!("dpkg-query: no packages found matching {}", missing.join(" ")),
            )
        }
    }

    fn apt_get(&mut self, args: &[String]) -> CommandOutput {
        let (_, operands) = flags_and_operands(args);
        let Some((verb, names)) = operands.split_first() else {
            return fail(100, "apt-get: missing command");
        };
        match *verb {
            "update" => ok(""),
            "install" => {
                for name in names {
                    self.install_package("apt", name);
                }
                ok("")
            }
            "remove" | "purge" => {
                if let Some(set) = self.packages.get_mut("apt") {
                    for name in names {
                        set.remove(*name);
                    }
                }
                ok("")
            }
            other => fail(100, format!("E: Invalid operation {}", other)),
        }
    }

    fn pip(&mut self, args: &[String]) -> CommandOutput {
        let (flags, operands) = flags_and_operands(args);
        let Some((verb, names)) = operands.split_first() else {
            return fail(1, "pip: missing command");
        };
        match *verb {
            "show" => match names.first() {
                Some(name) if self.is_installed("pip", name) => {
                    ok(format!("Name: {}\nVersion: 1.0\n", name))
                }
                _ => fail(1, "WARNING: Package(s) not found"),
            },
            // Nothing is ever outdated here
            "list" => ok(""),
            "install" if flags.contains(&"-r") => ok(""),
            "install" => {
                for name in names {
                    self.install_package("pip", name);
                }
                ok("")
            }
            "uninstall" => {
                if let Some(set) = self.packages.get_mut("pip") {
                    for name in names {
                        set.remove(*name);
                    }
                }
                ok("")
            }
            other => fail(1, format!("ERROR: unknown command \"{}\"", other)),
        }
    }

    fn gem(&mut self, args: &[String]) -> CommandOutput {
        let (_, operands) = flags_and_operands(args);
        let Some((verb, names)) = operands.split_first() else {
            return fail(1, "gem: missing command");
        };
        match *verb {
            "list" => {
                let name = names
                    .first()
                    .map(|n| n.trim_start_matches('^').trim_end_matches('$'))
                    .unwrap_or_default();
                if self.is_installed("gem", name) {
                    ok("true\n")
                } else {
                    CommandOutput::new(1, "false\n", "")
                }
            }
            "install" => {
                for name in names {
                    self.install_package("gem", name);
                }
                ok("")
            }
            "uninstall" => {
                if let Some(set) = self.packages.get_mut("gem") {
                    for name in names {
                        set.remove(*name);
                    }
                }
                ok("")
            }
            other => fail(1, format!("ERROR: Unknown command {}", other)),
        }
    }

    fn sha256sum(&self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let (_, operands) = flags_and_operands(args);
        let Some(path) = operands.first() else {
            return fail(1, "sha256sum: missing operand");
        };
        let path = Self::abs(cwd, path);
        match self.file(&path) {
            Some(content) => {
                let digest = Sha256::digest(content);
                let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
                ok(format!("{}  {}\n", hex, path))
            }
            None => fail(1, format!("sha256sum: {}: No such file or directory", path)),
        }
    }

    fn stat(&self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let mut format = "%a %U %G".to_string();
        let mut paths = Vec::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if arg == "-c" {
                if let Some(f) = iter.next() {
                    format = f.clone();
                }
            } else {
                paths.push(Self::abs(cwd, arg));
            }
        }

        let Some(node) = paths.first().and_then(|p| self.nodes.get(p)) else {
            return fail(1, "stat: cannot statx: No such file or directory");
        };
        let line = format
            .replace("%a", &format!("{:o}", node.mode))
            .replace("%U", &node.user)
            .replace("%G", &node.group);
        ok(format!("{}\n", line))
    }

    fn test(&self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let truth = match args {
            [flag, path] => {
                let node = self.nodes.get(&Self::abs(cwd, path));
                match flag.as_str() {
                    "-e" => node.is_some(),
                    "-f" => matches!(node.map(|n| &n.kind), Some(NodeKind::File(_))),
                    "-d" => matches!(node.map(|n| &n.kind), Some(NodeKind::Dir)),
                    "-L" | "-h" => matches!(node.map(|n| &n.kind), Some(NodeKind::Link(_))),
                    "-s" => matches!(node.map(|n| &n.kind), Some(NodeKind::File(c)) if !c.is_empty()),
                    "-n" => !path.is_empty(),
                    _ => false,
                }
            }
            [a, op, b] if op == "-nt" => {
                let a = self.nodes.get(&Self::abs(cwd, a)).map(|n| n.mtime);
                let b = self.nodes.get(&Self::abs(cwd, b)).map(|n| n.mtime);
                match (a, b) {
                    (Some(a), Some(b)) => a > b,
                    (Some(_), None) => true,
                    _ => false,
                }
            }
            _ => false,
        };
        if truth { ok("") } else { fail(1, "") }
    }

    fn cat(&self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let (_, operands) = flags_and_operands(args);
        let mut out = Vec::new();
        for path in operands {
            match self.file(&Self::abs(cwd, path)) {
                Some(content) => out.extend_from_slice(content),
                None => return fail(1, format!("cat: {}: No such file or directory", path)),
            }
        }
        ok(out)
    }

    fn cp(&mut self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let (flags, operands) = flags_and_operands(args);
        let [src, dst] = operands[..] else {
            return fail(1, "cp: missing operand");
        };
        let src = Self::abs(cwd, src);
        let dst = Self::abs(cwd, dst);
        let Some(node) = self.nodes.get(&src).cloned() else {
            return fail(1, format!("cp: cannot stat '{}'", src));
        };
        let NodeKind::File(content) = node.kind else {
            return fail(1, format!("cp: -r not specified; omitting directory '{}'", src));
        };
        if !self.write_file(&dst, &content) {
            return fail(1, format!("cp: cannot create regular file '{}'", dst));
        }
        if flags.iter().any(|f| f.contains('p'))
            && let Some(copy) = self.nodes.get_mut(&dst)
        {
            copy.mode = node.mode;
            copy.user = node.user;
            copy.group = node.group;
        }
        ok("")
    }

    fn mv(&mut self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let (_, operands) = flags_and_operands(args);
        let [src, dst] = operands[..] else {
            return fail(1, "mv: missing operand");
        };
        let src = Self::abs(cwd, src);
        let dst = Self::abs(cwd, dst);
        match self.nodes.remove(&src) {
            Some(mut node) => {
                node.mtime = self.tick();
                self.nodes.insert(dst, node);
                ok("")
            }
            None => fail(1, format!("mv: cannot stat '{}'", src)),
        }
    }

    fn rm(&mut self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let (flags, operands) = flags_and_operands(args);
        let force = flags.iter().any(|f| f.contains('f'));
        let recursive = flags.iter().any(|f| f.contains('r') || f.contains('R'));
        for path in operands {
            let path = Self::abs(cwd, path);
            match self.nodes.get(&path).map(|n| n.kind.clone()) {
                None if force => {}
                None => return fail(1, format!("rm: cannot remove '{}'", path)),
                Some(NodeKind::Dir) if !recursive => {
                    return fail(1, format!("rm: cannot remove '{}': Is a directory", path));
                }
                Some(_) => self.remove_tree(&path),
            }
        }
        ok("")
    }

    fn rmdir(&mut self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let (flags, operands) = flags_and_operands(args);
        let ignore_non_empty = flags.contains(&"--ignore-fail-on-non-empty");
        for path in operands {
            let path = Self::abs(cwd, path);
            if !self.is_dir(&path) {
                return fail(1, format!("rmdir: failed to remove '{}'", path));
            }
            if self.subtree(&path).len() > 1 {
                if ignore_non_empty {
                    continue;
                }
                return fail(1, format!("rmdir: failed to remove '{}': Directory not empty", path));
            }
            self.nodes.remove(&path);
        }
        ok("")
    }

    fn touch(&mut self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let (_, operands) = flags_and_operands(args);
        for path in operands {
            let path = Self::abs(cwd, path);
            let mtime = self.tick();
            if let Some(node) = self.nodes.get_mut(&path) {
                node.mtime = mtime;
            } else if !self.write_file(&path, b"") {
                return fail(1, format!("touch: cannot touch '{}'", path));
            }
        }
        ok("")
    }

    fn chown(&mut self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let (flags, operands) = flags_and_operands(args);
        let recursive = flags.contains(&"-R");
        let Some((owner, paths)) = operands.split_first() else {
            return fail(1, "chown: missing operand");
        };
        let (user, group) = split_owner(owner);
        for path in paths {
            let path = Self::abs(cwd, path);
            if !self.nodes.contains_key(&path) {
                return fail(1, format!("chown: cannot access '{}'", path));
            }
            let targets = if recursive {
                self.subtree(&path)
            } else {
                vec![path]
            };
            for target in targets {
                if let Some(node) = self.nodes.get_mut(&target) {
                    node.user = user.clone();
                    if let Some(group) = &group {
                        node.group = group.clone();
                    }
                }
            }
        }
        ok("")
    }

    fn chmod(&mut self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let (flags, operands) = flags_and_operands(args);
        let recursive = flags.contains(&"-R");
        let Some((mode, paths)) = operands.split_first() else {
            return fail(1, "chmod: missing operand");
        };
        let octal = u32::from_str_radix(mode, 8).ok();
        for path in paths {
            let path = Self::abs(cwd, path);
            if !self.nodes.contains_key(&path) {
                return fail(1, format!("chmod: cannot access '{}'", path));
            }
            let targets = if recursive {
                self.subtree(&path)
            } else {
                vec![path]
            };
            for target in targets {
                let Some(node) = self.nodes.get_mut(&target) else {
                    continue;
                };
                if matches!(node.kind, NodeKind::Link(_)) {
                    continue;
                }
                let is_dir = node.kind == NodeKind::Dir;
                match octal.or_else(|| symbolic_mode(mode, node.mode, is_dir)) {
                    Some(next) => node.mode = next,
                    None => return fail(1, format!("chmod: invalid mode: '{}'", mode)),
                }
            }
        }
        ok("")
    }

    fn service(&mut self, args: &[String]) -> CommandOutput {
        let [name, verb] = args else {
            return fail(1, "Usage: service < option > | --status-all");
        };
        // upstart picks up any job file dropped into /etc/init
        if !self.services.contains_key(name.as_str())
            && self.exists(&format!("/etc/init/{}.conf", name))
        {
            self.services.insert(name.clone(), false);
        }
        let Some(running) = self.services.get_mut(name.as_str()) else {
            return fail(1, format!("{}: unrecognized service", name));
        };
        match verb.as_str() {
            "status" if *running => ok(format!("{} is running\n", name)),
            "status" => CommandOutput::new(3, format!("{} is not running\n", name), ""),
            "start" | "restart" => {
                *running = true;
                ok("")
            }
            "stop" => {
                *running = false;
                ok("")
            }
            other => fail(1, format!("Usage: /etc/init.d/{} {{start|stop}} ({})", name, other)),
        }
    }

    fn id(&self, args: &[String]) -> CommandOutput {
        let (_, operands) = flags_and_operands(args);
        match operands.first() {
            Some(name) if self.users.contains(*name) => ok("1000\n"),
            Some(name) => fail(1, format!("id: '{}': no such user", name)),
            None => ok("0\n"),
        }
    }

    fn readlink(&self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let (_, operands) = flags_and_operands(args);
        let path = operands.first().map(|p| Self::abs(cwd, p)).unwrap_or_default();
        match self.nodes.get(&path).map(|n| &n.kind) {
            Some(NodeKind::Link(target)) => ok(format!("{}\n", target)),
            _ => fail(1, ""),
        }
    }

    fn ln(&mut self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let (_, operands) = flags_and_operands(args);
        let [target, link] = operands[..] else {
            return fail(1, "ln: missing operand");
        };
        let link = Self::abs(cwd, link);
        if !parent(&link).is_some_and(|p| self.is_dir(&p)) {
            return fail(1, format!("ln: failed to create symbolic link '{}'", link));
        }
        self.link(&link, target);
        ok("")
    }

    fn grep(&self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let (flags, operands) = flags_and_operands(args);
        let letters: String = flags.iter().map(|f| f.trim_start_matches('-')).collect();
        let [pattern, path] = operands[..] else {
            return fail(2, "grep: usage");
        };
        let Some(content) = self.file(&Self::abs(cwd, path)) else {
            return fail(2, format!("grep: {}: No such file or directory", path));
        };
        let text = String::from_utf8_lossy(content);
        let whole_line = letters.contains('x');

        let matched = if letters.contains('F') {
            text.lines().any(|l| if whole_line { l == pattern } else { l.contains(pattern) })
        } else {
            let source = if whole_line {
                format!("^(?:{})$", pattern)
            } else {
                pattern.to_string()
            };
            let Ok(re) = Regex::new(&source) else {
                return fail(2, "grep: invalid regex");
            };
            text.lines().any(|l| re.is_match(l))
        };

        if matched { ok("") } else { fail(1, "") }
    }

    fn sed(&mut self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let mut expressions = Vec::new();
        let mut files = Vec::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-i" | "-E" | "-r" => {}
                "-e" => {
                    if let Some(e) = iter.next() {
                        expressions.push(e.clone());
                    }
                }
                other => files.push(Self::abs(cwd, other)),
            }
        }
        let [path] = &files[..] else {
            return fail(1, "sed: expected one file");
        };
        let Some(content) = self.file(path) else {
            return fail(2, format!("sed: can't read {}", path));
        };

        let mut lines: Vec<String> = String::from_utf8_lossy(content)
            .lines()
            .map(String::from)
            .collect();
        for expr in &expressions {
            match apply_sed(expr, &lines) {
                Some(next) => lines = next,
                None => return fail(1, format!("sed: unsupported expression {}", expr)),
            }
        }

        let mut text = lines.join("\n");
        if !lines.is_empty() {
            text.push('\n');
        }
        let mode = self.nodes.get(path).map(|n| n.mode);
        self.write_file(path, text.as_bytes());
        if let (Some(mode), Some(node)) = (mode, self.nodes.get_mut(path)) {
            node.mode = mode;
        }
        ok("")
    }

    fn git(&mut self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let mut dir = cwd.map(String::from);
        let mut rest = args;
        loop {
            match rest {
                [flag, value, tail @ ..] if flag == "-c" => {
                    let _ = value;
                    rest = tail;
                }
                [flag, value, tail @ ..] if flag == "-C" => {
                    dir = Some(Self::abs(cwd, value));
                    rest = tail;
                }
                _ => break,
            }
        }

        match rest {
            [clone, tail @ ..] if clone == "clone" => {
                let (branch, operands) = match tail {
                    [b, branch, operands @ ..] if b == "-b" => (branch.clone(), operands),
                    operands => ("master".to_string(), operands),
                };
                let [url, dest] = operands else {
                    return fail(129, "usage: git clone <repo> <dir>");
                };
                let dest = Self::abs(dir.as_deref(), dest);
                if self.exists(&dest) {
                    return fail(
                        128,
                        format!("fatal: destination path '{}' already exists", dest),
                    );
                }
                self.mkdir_p(&format!("{}/.git", dest));
                for (path, content) in self.checkouts.get(url).cloned().unwrap_or_default() {
                    let path = format!("{}/{}", dest, path);
                    if let Some(dir) = parent(&path) {
                        self.mkdir_p(&dir);
                    }
                    self.write_file(&path, content.as_bytes());
                }
                self.repos.insert(dest, (url.clone(), branch));
                ok("")
            }
            [config, get, key] if config == "config" && get == "--get" => {
                let Some((url, _)) = dir.as_ref().and_then(|d| self.repos.get(d)) else {
                    return fail(128, "fatal: not a git repository");
                };
                if key == "remote.origin.url" {
                    ok(format!("{}\n", url))
                } else {
                    fail(1, "")
                }
            }
            [rev_parse, abbrev, head]
                if rev_parse == "rev-parse" && abbrev == "--abbrev-ref" && head == "HEAD" =>
            {
                match dir.as_ref().and_then(|d| self.repos.get(d)) {
                    Some((_, branch)) => ok(format!("{}\n", branch)),
                    None => fail(128, "fatal: not a git repository"),
                }
            }
            [checkout, branch] if checkout == "checkout" => {
                match dir.as_ref().and_then(|d| self.repos.get_mut(d)) {
                    Some(repo) => {
                        repo.1 = branch.clone();
                        ok("")
                    }
                    None => fail(128, "fatal: not a git repository"),
                }
            }
            _ => fail(1, "git: unsupported invocation"),
        }
    }

    /// `find ROOT [-maxdepth 0] PREDICATE... -print -quit` with `!`,
    /// `-user`, `-group`, `-type` and symbolic `-perm -MODE` / `-perm /MODE`
    fn find(&self, args: &[String], cwd: Option<&str>) -> CommandOutput {
        let [root, rest @ .., print, quit] = args else {
            return fail(1, "find: unsupported expression");
        };
        if print != "-print" || quit != "-quit" {
            return fail(1, "find: unsupported expression");
        }
        let (shallow, mut rest) = match rest {
            [flag, depth, tail @ ..] if flag == "-maxdepth" && depth == "0" => (true, tail),
            _ => (false, rest),
        };

        let mut predicates = Vec::new();
        while !rest.is_empty() {
            let negate = rest[0] == "!";
            if negate {
                rest = &rest[1..];
            }
            let [test, value, tail @ ..] = rest else {
                return fail(1, "find: unsupported expression");
            };
            predicates.push((negate, test.as_str(), value.as_str()));
            rest = tail;
        }

        let root = Self::abs(cwd, root);
        if !self.nodes.contains_key(&root) {
            return fail(1, format!("find: '{}': No such file or directory", root));
        }
        let candidates = if shallow {
            vec![root]
        } else {
            self.subtree(&root)
        };

        let mut found = None;
        for path in candidates {
            let Some(node) = self.nodes.get(&path) else {
                continue;
            };
            let mut all = true;
            for (negate, test, value) in &predicates {
                let Some(hit) = find_test(node, test, value) else {
                    return fail(1, format!("find: unknown predicate {} {}", test, value));
                };
                all &= hit != *negate;
            }
            if all {
                found = Some(path);
                break;
            }
        }
        ok(found.map(|p| format!("{}\n", p)).unwrap_or_default())
    }

    /// Store an upload the way `install -m MODE [-o U -g G]` would
    pub fn put(&mut self, content: &[u8], path: &str, opts: &PutOptions) -> Result<(), SessionError> {
        self.log.push(format!("put {}", path));

        if let Some(remaining) = self.dropped.get_mut(&format!("put {}", path))
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(SessionError::Transfer {
                path: path.to_string(),
                message: "Broken pipe".to_string(),
            });
        }

        if !self.write_file(path, content) {
            return Err(SessionError::Transfer {
                path: path.to_string(),
                message: "install: cannot create regular file: No such file or directory"
                    .to_string(),
            });
        }

        let (user, group) = opts
            .owner
            .as_deref()
            .map(split_owner)
            .unwrap_or_else(|| ("root".to_string(), Some("root".to_string())));
        if let Some(node) = self.nodes.get_mut(&normalize(path)) {
            node.mode = opts.mode.unwrap_or(0o644);
            node.user = user;
            node.group = group.unwrap_or_else(|| "root".to_string());
        }
        Ok(())
    }
}

/// Permission bits for `who` (`ugoa`) and `perms` (`rwx`)
fn perm_bits(who: &str, perms: &str) -> u32 {
    let mut bits = 0;
    for w in who.chars() {
        let shifts: &[u32] = match w {
            'u' => &[6],
            'g' => &[3],
            'o' => &[0],
            _ => &[6, 3, 0],
        };
        for shift in shifts {
            for p in perms.chars() {
                bits |= match p {
                    'r' => 4,
                    'w' => 2,
                    'x' => 1,
                    _ => 0,
                } << shift;
            }
        }
    }
    bits
}

/// `mode` after a symbolic chmod such as `u+rwX,o-rw`
fn symbolic_mode(spec: &str, mode: u32, is_dir: bool) -> Option<u32> {
    let mut next = mode;
    for clause in spec.split(',') {
        let at = clause.find(['+', '-'])?;
        let (who, rest) = clause.split_at(at);
        let (op, perms) = rest.split_at(1);
        let executable = is_dir || mode & 0o111 != 0;
        let perms: String = perms
            .chars()
            .filter_map(|c| match c {
                'X' if executable => Some('x'),
                'X' => None,
                c => Some(c),
            })
            .collect();
        let bits = perm_bits(who, &perms);
        if op == "+" {
            next |= bits;
        } else {
            next &= !bits;
        }
    }
    Some(next)
}

/// One `find` test against `node`; `None` for tests the host does not know
fn find_test(node: &Node, test: &str, value: &str) -> Option<bool> {
    match test {
        "-user" => Some(node.user == value),
        "-group" => Some(node.group == value),
        "-type" => Some(matches!(
            (&node.kind, value),
            (NodeKind::Dir, "d") | (NodeKind::File(_), "f") | (NodeKind::Link(_), "l")
        )),
        "-perm" => {
            let (all, spec) = match value.split_at_checked(1)? {
                ("-", spec) => (true, spec),
                ("/", spec) => (false, spec),
                _ => return None,
            };
            let (who, perms) = spec.split_once('=')?;
            let bits = perm_bits(who, perms);
            Some(if all {
                node.mode & bits == bits
            } else {
                node.mode & bits != 0
            })
        }
        _ => None,
    }
}

/// Apply one of the sed expressions the steps emit:
/// `s<d>re<d>rep<d>`, `\<d>re<d>d` and `$a\text`
fn apply_sed(expr: &str, lines: &[String]) -> Option<Vec<String>> {
    if let Some(text) = expr.strip_prefix("$a\\") {
        let mut out = lines.to_vec();
        out.push(text.replace("\\\\", "\\"));
        return Some(out);
    }

    if let Some(rest) = expr.strip_prefix('s') {
        let delim = rest.chars().next()?;
        let parts: Vec<&str> = rest[delim.len_utf8()..].split(delim).collect();
        let [pattern, replacement, ""] = parts[..] else {
            return None;
        };
        let re = Regex::new(pattern).ok()?;
        let replacement = unescape_replacement(replacement);
        return Some(
            lines
                .iter()
                .map(|l| re.replacen(l, 1, regex::NoExpand(&replacement)).into_owned())
                .collect(),
        );
    }

    let address = match expr.strip_prefix('\\') {
        Some(rest) => Some(rest),
        None if expr.starts_with('/') => Some(expr),
        None => None,
    };
    if let Some(rest) = address {
        let delim = rest.chars().next()?;
        let body = rest[delim.len_utf8()..].strip_suffix('d')?;
        let pattern = body.strip_suffix(delim)?;
        let re = Regex::new(pattern).ok()?;
        return Some(lines.iter().filter(|l| !re.is_match(l)).cloned().collect());
    }

    None
}

fn unescape_replacement(replacement: &str) -> String {
    let mut out = String::new();
    let mut chars = replacement.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Session handle onto a shared [`SimHost`]
pub struct SimSession {
    host: Rc<RefCell<SimHost>>,
}

impl SimSession {
    pub fn connect(host: &Rc<RefCell<SimHost>>) -> Self {
        Self {
            host: Rc::clone(host),
        }
    }
}

impl Session for SimSession {
    fn host(&self) -> &str {
        "sim"
    }

    fn run(&mut self, command: &str, opts: &RunOptions) -> Result<CommandOutput, SessionError> {
        self.host.borrow_mut().exec(command, opts)
    }

    fn put_file(
        &mut self,
        content: &[u8],
        remote_path: &str,
        opts: &PutOptions,
    ) -> Result<(), SessionError> {
        self.host.borrow_mut().put(content, remote_path, opts)
    }

    fn close(&mut self) {
        self.host.borrow_mut().closes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(host: &mut SimHost, command: &str) -> CommandOutput {
        host.exec(command, &RunOptions::sudo()).unwrap()
    }

    #[test]
    fn test_sed_substitute_and_delete() {
        let lines: Vec<String> = ["USER = carbon", "DATABASE = whisper"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let replaced = apply_sed("s|^USER = .*$|USER = graphite|", &lines).unwrap();
        assert_eq!(replaced[0], "USER = graphite");

        let deleted = apply_sed("\\|^DATABASE = whisper$|d", &replaced).unwrap();
        assert_eq!(deleted, ["USER = graphite"]);

        let appended = apply_sed("$a\\gem \"pg\"", &deleted).unwrap();
        assert_eq!(appended.last().unwrap(), "gem \"pg\"");
    }

    #[test]
    fn test_negated_command() {
        let mut host = SimHost::new();
        assert!(run(&mut host, "! test -e /etc/motd").success());
        host.write_file("/etc/motd", b"hi\n");
        assert!(!run(&mut host, "! test -e /etc/motd").success());
    }

    #[test]
    fn test_mtime_ordering() {
        let mut host = SimHost::new();
        host.write_file("/etc/a", b"a");
        host.write_file("/etc/b", b"b");
        assert!(run(&mut host, "test /etc/b -nt /etc/a").success());
        run(&mut host, "touch /etc/a");
        assert!(!run(&mut host, "test /etc/b -nt /etc/a").success());
    }

    #[test]
    fn test_apt_install_hooks() {
        let mut host = SimHost::new();
        run(&mut host, "apt-get install -y nginx");
        assert!(host.exists("/etc/nginx/sites-available"));
        assert_eq!(host.services.get("nginx"), Some(&true));
        assert!(run(&mut host, "dpkg-query -W -f '${Package} ${Status}\\n' nginx").success());
    }
}
