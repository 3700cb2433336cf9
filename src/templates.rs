//! Configuration file templates
//!
//! Templates are plain text with `{{name}}` placeholders, compiled into the
//! binary. Rendering fails on any placeholder without a value so a typo never
//! reaches a host.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template {template} has no value for {{{{{name}}}}}")]
    Unresolved { template: String, name: String },

    #[error("template placeholder pattern failed to compile")]
    Pattern,
}

static PLACEHOLDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").ok());

/// A named template compiled into the binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template {
    pub name: &'static str,
    pub source: &'static str,
}

macro_rules! template {
    ($const:ident, $path:literal) => {
        pub const $const: Template = Template {
            name: $path,
            source: include_str!(concat!("../templates/", $path)),
        };
    };
}

template!(GRAPHITE_NGINX, "graphite/nginx.conf");
template!(GRAPHITE_UWSGI, "graphite/uwsgi.ini");
template!(CARBON_WRITER_UPSTART, "graphite/carbon-writer.upstart");
template!(CARBON_WRITER_MONIT, "graphite/carbon-writer.monit");
template!(STATSD_CONFIG, "statsd/localConfig.js");
template!(STATSD_UPSTART, "statsd/statsd.upstart");
template!(STATSD_MONIT, "statsd/statsd.monit");
template!(DASHBOARD_DATABASE, "team-dashboard/database.yml");
template!(DASHBOARD_NGINX, "team-dashboard/nginx.conf");
template!(DASHBOARD_UPSTART, "team-dashboard/unicorn.upstart");

/// Every bundled template
pub const ALL: [Template; 10] = [
    GRAPHITE_NGINX,
    GRAPHITE_UWSGI,
    CARBON_WRITER_UPSTART,
    CARBON_WRITER_MONIT,
    STATSD_CONFIG,
    STATSD_UPSTART,
    STATSD_MONIT,
    DASHBOARD_DATABASE,
    DASHBOARD_NGINX,
    DASHBOARD_UPSTART,
];

impl Template {
    /// Substitute every placeholder from `values`
    pub fn render(&self, values: &BTreeMap<String, String>) -> Result<String, TemplateError> {
        render(self.name, self.source, values)
    }

    /// Placeholder names, in order of first use
    pub fn placeholders(&self) -> Vec<String> {
        let Some(re) = PLACEHOLDER.as_ref() else {
            return Vec::new();
        };
        let mut names: Vec<String> = Vec::new();
        for caps in re.captures_iter(self.source) {
            let name = caps[1].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

/// Render `source` with `{{name}}` placeholders
pub fn render(
    template: &str,
    source: &str,
    values: &BTreeMap<String, String>,
) -> Result<String, TemplateError> {
    let re = PLACEHOLDER.as_ref().ok_or(TemplateError::Pattern)?;

    let mut missing = None;
    let rendered = re.replace_all(source, |caps: &Captures| {
        let name = &caps[1];
        match values.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(TemplateError::Unresolved {
            template: template.to_string(),
            name,
        }),
        None => Ok(rendered.into_owned()),
    }
}
