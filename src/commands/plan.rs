use anyhow::Result;
use colored::Colorize;
use declarative::{RoleParams, RoleRegistry};

use super::provision::{merge_params, resolve_plan};
use crate::Context;
use crate::config::StackupConfig;
use crate::ui;

/// Print the resolved step order for `role` without connecting anywhere
pub fn run(
    ctx: &Context,
    registry: &RoleRegistry,
    config: &StackupConfig,
    role: &str,
    params: &RoleParams,
    only: &[String],
) -> Result<()> {
    let plan = resolve_plan(registry, role, &merge_params(config, params), only)?;
    let order = plan.topological_order()?;

    if !ctx.quiet {
        let roles: Vec<&str> = registry
            .expansion_order(role)?
            .iter()
            .map(|r| r.name())
            .collect();
        ui::header(&format!("Plan for {}", role));
        ui::kv("roles", &roles.join(" → "));
        ui::kv("steps", &order.len().to_string());
        println!();
    }

    let width = order.len().to_string().len();
    for (i, step) in order.iter().enumerate() {
        println!(
            "{} {} {}",
            format!("{:>width$}.", i + 1, width = width).dimmed(),
            step.id(),
            format!("[{}]", step.kind()).dimmed()
        );
        if ctx.verbose > 0 {
            ui::dim(&format!("{:>width$}  {}", "", step.description(), width = width));
            if let Some(entry) = plan.get(step.id())
                && ctx.verbose > 1
                && !entry.depends_on().is_empty()
            {
                let deps: Vec<&str> = entry.depends_on().iter().map(String::as_str).collect();
                ui::dim(&format!("{:>width$}  after {}", "", deps.join(", "), width = width));
            }
        }
    }
    Ok(())
}
