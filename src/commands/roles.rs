use anyhow::Result;
use colored::Colorize;
use declarative::RoleRegistry;

use crate::Context;
use crate::ui;

/// One line per role: name, description, dependencies and parameters
pub fn run(ctx: &Context, registry: &RoleRegistry) -> Result<()> {
    ui::header("Roles");

    let width = registry
        .roles()
        .iter()
        .map(|r| r.name().len())
        .max()
        .unwrap_or(0);

    for role in registry.roles() {
        let params = registry.required_params(role.name())?;
        let usage = params
            .iter()
            .map(|p| format!("<{}>", p.to_uppercase()))
            .collect::<Vec<_>>()
            .join(" ");

        println!(
            "  {}  {}",
            format!("{:<width$}", role.name()).bold(),
            role.description()
        );
        if !usage.is_empty() {
            ui::dim(&format!("{:<width$}  usage: stackup {} {}", "", role.name(), usage));
        }
        if ctx.verbose > 0 && !role.dependencies().is_empty() {
            ui::dim(&format!(
                "{:<width$}  after: {}",
                "",
                role.dependencies().join(", ")
            ));
        }
    }

    println!();
    Ok(())
}
