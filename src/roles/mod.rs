//! The metrics-stack role catalogue
//!
//! | role | depends on | parameters |
//! |---|---|---|
//! | `base` | | |
//! | `graphite` | `base` | |
//! | `node` | | |
//! | `statsd` | `node`, `graphite` | |
//! | `ruby` | | |
//! | `team-dashboard` | `ruby`, `graphite` | `pg_host` |
//! | `monitor-all-the-things` | `graphite`, `statsd`, `team-dashboard` | |
//!
//! `graphite_root` and `timezone` are optional settings read from the same
//! parameter map; the command layer fills them from the config file.

mod dashboard;
mod graphite;
mod statsd;

use crate::templates::{Template, TemplateError};
use anyhow::Result;
use declarative::{Plan, Role, RoleParams, RoleRegistry};

pub const DEFAULT_GRAPHITE_ROOT: &str = "/opt/graphite";
pub const DEFAULT_TIMEZONE: &str = "Pacific/Auckland";
pub const STATSD_ROOT: &str = "/opt/statsd";
pub const DASHBOARD_ROOT: &str = "/opt/team_dashboard";

/// Settings keys that are not role parameters
pub const SETTING_GRAPHITE_ROOT: &str = "graphite_root";
pub const SETTING_TIMEZONE: &str = "timezone";

/// Build the registry with every metrics-stack role
pub fn registry() -> Result<RoleRegistry> {
    let mut registry = RoleRegistry::new();
    registry
        .register(
            Role::new("base", graphite::base)
                .with_description("Package index, base packages and the latest pip"),
        )?
        .register(
            Role::new("graphite", graphite::graphite)
                .with_description("ceres, carbon writer and graphite-web behind nginx/uwsgi")
                .depends_on(["base"]),
        )?
        .register(
            Role::new("node", statsd::node)
                .with_description("node.js from the chris-lea PPA and a statsd checkout"),
        )?
        .register(
            Role::new("statsd", statsd::statsd)
                .with_description("statsd upstart job and monit check")
                .depends_on(["node", "graphite"]),
        )?
        .register(
            Role::new("ruby", dashboard::ruby)
                .with_description("ruby 1.9.1 toolchain as the default ruby"),
        )?
        .register(
            Role::new("team-dashboard", dashboard::team_dashboard)
                .with_description("Team Dashboard on unicorn behind nginx, port 8081")
                .depends_on(["ruby", "graphite"])
                .param("pg_host"),
        )?
        .register(
            Role::new("monitor-all-the-things", |_params: &RoleParams| {
                Ok(Plan::new("monitor-all-the-things"))
            })
            .with_description("graphite, statsd and team-dashboard together")
            .depends_on(["graphite", "statsd", "team-dashboard"]),
        )?;
    Ok(registry)
}

/// Values available to templates: parameters plus resolved settings
pub(crate) struct Vars {
    values: RoleParams,
}

impl Vars {
    pub fn new(params: &RoleParams) -> Self {
        let mut values = params.clone();
        for (key, default) in [
            (SETTING_GRAPHITE_ROOT, DEFAULT_GRAPHITE_ROOT),
            (SETTING_TIMEZONE, DEFAULT_TIMEZONE),
            ("statsd_root", STATSD_ROOT),
            ("app_root", DASHBOARD_ROOT),
        ] {
            values
                .entry(key.to_string())
                .or_insert_with(|| default.to_string());
        }

        if let Some(root) = values.get_mut(SETTING_GRAPHITE_ROOT) {
            let trimmed = root.trim_end_matches('/');
            if !trimmed.is_empty() {
                *root = trimmed.to_string();
            }
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> &str {
        self.values.get(key).map_or("", String::as_str)
    }

    pub fn graphite_root(&self) -> &str {
        self.get(SETTING_GRAPHITE_ROOT)
    }

    /// `graphite_root` joined with a relative path
    pub fn graphite(&self, path: &str) -> String {
        format!("{}/{}", self.graphite_root(), path)
    }

    pub fn render(&self, template: &Template) -> Result<String, TemplateError> {
        template.render(&self.values)
    }
}
