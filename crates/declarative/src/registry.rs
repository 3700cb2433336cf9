//! Role registry - named, reusable plans with inter-role dependencies

use crate::error::RegistryError;
use crate::plan::Plan;
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Parameters supplied by the operator, keyed by declared parameter name
pub type RoleParams = BTreeMap<String, String>;

type PlanBuilder = Box<dyn Fn(&RoleParams) -> Result<Plan> + Send + Sync>;

/// A named provisioning role
pub struct Role {
    name: String,
    description: String,
    depends_on: Vec<String>,
    params: Vec<String>,
    builder: PlanBuilder,
}

impl Role {
    pub fn new<F>(name: impl Into<String>, builder: F) -> Self
    where
        F: Fn(&RoleParams) -> Result<Plan> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            depends_on: Vec::new(),
            params: Vec::new(),
            builder: Box::new(builder),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Roles whose plans must be applied before this one
    pub fn depends_on<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Declare a required parameter
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Build this role's own plan, without its dependencies
    pub fn build(&self, params: &RoleParams) -> Result<Plan> {
        (self.builder)(params)
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Role")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Registry of roles, in registration order
#[derive(Debug, Default)]
pub struct RoleRegistry {
    roles: Vec<Role>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a role. Dependencies may name roles registered later.
    pub fn register(&mut self, role: Role) -> Result<&mut Self, RegistryError> {
        if self.get(role.name()).is_some() {
            return Err(RegistryError::DuplicateRole {
                name: role.name().to_string(),
            });
        }
        self.roles.push(role);
        Ok(self)
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn get(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name() == name)
    }

    /// Roles to apply for `name`, dependencies first (depth-first post-order)
    pub fn expansion_order(&self, name: &str) -> Result<Vec<&Role>, RegistryError> {
        let mut order = Vec::new();
        let mut stack = Vec::new();
        let mut done = HashSet::new();
        self.visit(name, &mut stack, &mut done, &mut order)?;
        Ok(order)
    }

    /// Parameters required by `name` and everything it depends on
    pub fn required_params(&self, name: &str) -> Result<Vec<String>, RegistryError> {
        let mut params: Vec<String> = Vec::new();
        for role in self.expansion_order(name)? {
            for param in role.params() {
                if !params.contains(param) {
                    params.push(param.clone());
                }
            }
        }
        Ok(params)
    }

    /// Expand `name` into one merged, validated plan.
    ///
    /// Role plans are merged in expansion order. A step name seen twice keeps
    /// its first definition. Every step of a role depends on every step
    /// provided by the roles it depends on, transitively.
    pub fn resolve(&self, name: &str, params: &RoleParams) -> Result<Plan, RegistryError> {
        let order = self.expansion_order(name)?;

        for role in &order {
            if let Some(missing) = role.params().iter().find(|p| !params.contains_key(*p)) {
                return Err(RegistryError::MissingParameter {
                    role: role.name().to_string(),
                    param: missing.clone(),
                });
            }
        }

        let mut merged = Plan::new(name);
        let mut provided: HashMap<&str, BTreeSet<String>> = HashMap::new();

        for role in order {
            let plan = role.build(params).map_err(|source| RegistryError::Build {
                role: role.name().to_string(),
                source,
            })?;
            plan.validate().map_err(|source| RegistryError::Plan {
                role: role.name().to_string(),
                source,
            })?;

            let mut upstream = BTreeSet::new();
            for dep in role.dependencies() {
                if let Some(steps) = provided.get(dep.as_str()) {
                    upstream.extend(steps.iter().cloned());
                }
            }

            let mut own = upstream.clone();
            for entry in plan.entries() {
                own.insert(entry.name().to_string());
                if merged.contains(entry.name()) {
                    log::debug!(
                        "role {}: step {} already planned, keeping first definition",
                        role.name(),
                        entry.name()
                    );
                    continue;
                }
                let deps = entry.depends_on().iter().chain(upstream.iter()).cloned();
                merged.add_step(Arc::clone(entry.step()), deps.collect::<Vec<_>>());
            }

            log::debug!("role {} contributes {} step(s)", role.name(), plan.len());
            provided.insert(role.name(), own);
        }

        merged.validate().map_err(|source| RegistryError::Plan {
            role: name.to_string(),
            source,
        })?;
        Ok(merged)
    }

    fn visit<'a>(
        &'a self,
        name: &str,
        stack: &mut Vec<String>,
        done: &mut HashSet<String>,
        order: &mut Vec<&'a Role>,
    ) -> Result<(), RegistryError> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(pos) = stack.iter().position(|n| n == name) {
            let mut path = stack[pos..].to_vec();
            path.push(name.to_string());
            return Err(RegistryError::RoleCycle { path });
        }

        let role = self.get(name).ok_or_else(|| RegistryError::UnknownRole {
            name: name.to_string(),
        })?;

        stack.push(name.to_string());
        for dep in role.dependencies() {
            self.visit(dep, stack, done, order)?;
        }
        stack.pop();

        done.insert(name.to_string());
        order.push(role);
        Ok(())
    }
}
