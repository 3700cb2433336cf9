//! Provisioning plans - dependency-ordered step collections

use crate::error::PlanError;
use crate::step::{SharedStep, Step};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// A step and the names of the steps it depends on
#[derive(Debug, Clone)]
pub struct PlanEntry {
    step: SharedStep,
    depends_on: BTreeSet<String>,
}

impl PlanEntry {
    pub fn step(&self) -> &SharedStep {
        &self.step
    }

    pub fn name(&self) -> &str {
        self.step.id()
    }

    pub fn depends_on(&self) -> &BTreeSet<String> {
        &self.depends_on
    }
}

/// An ordered set of steps with declared dependencies
#[derive(Debug, Clone, Default)]
pub struct Plan {
    name: String,
    entries: Vec<PlanEntry>,
}

impl Plan {
    /// Create a new empty plan
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a shared step with extra dependencies.
    ///
    /// The step's own [`prerequisites`](Step::prerequisites) are merged in.
    /// Names are not checked here; see [`validate`](Self::validate).
    pub fn add_step<I, S>(&mut self, step: SharedStep, depends_on: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut deps: BTreeSet<String> = depends_on.into_iter().map(Into::into).collect();
        deps.extend(step.prerequisites().iter().cloned());
        self.entries.push(PlanEntry {
            step,
            depends_on: deps,
        });
        self
    }

    /// Add a step that only depends on its own prerequisites
    pub fn add(&mut self, step: impl Step + 'static) -> &mut Self {
        self.add_step(Arc::new(step), std::iter::empty::<String>())
    }

    /// Add a step that runs after the named steps
    pub fn add_after<I, S>(&mut self, step: impl Step + 'static, depends_on: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_step(Arc::new(step), depends_on)
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    /// Look up an entry by step name
    pub fn get(&self, name: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Names of all steps in insertion order
    pub fn step_names(&self) -> Vec<&str> {
        self.entries.iter().map(PlanEntry::name).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check names, dependencies and acyclicity
    pub fn validate(&self) -> Result<(), PlanError> {
        self.topological_order().map(|_| ())
    }

    /// Order steps so every step follows its dependencies.
    ///
    /// Kahn's algorithm; among ready steps the one inserted first goes
    /// next, so the order is stable across runs.
    pub fn topological_order(&self) -> Result<Vec<SharedStep>, PlanError> {
        let index = self.index()?;
        let n = self.entries.len();

        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, entry) in self.entries.iter().enumerate() {
            for dep in &entry.depends_on {
                let j = index[dep.as_str()];
                in_degree[i] += 1;
                dependents[j].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &d in &dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        if order.len() < n {
            let steps = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.entries[i].name().to_string())
                .collect();
            return Err(PlanError::Cycle { steps });
        }

        Ok(order
            .into_iter()
            .map(|i| Arc::clone(&self.entries[i].step))
            .collect())
    }

    /// Restrict the plan to the named steps and everything they depend on
    pub fn filter<S: AsRef<str>>(&self, names: &[S]) -> Result<Self, PlanError> {
        let index = self.index()?;
        let mut keep = BTreeSet::new();
        let mut stack = Vec::new();

        for name in names {
            let name = name.as_ref();
            let Some(&i) = index.get(name) else {
                return Err(PlanError::UnknownStep {
                    name: name.to_string(),
                });
            };
            stack.push(i);
        }

        while let Some(i) = stack.pop() {
            if keep.insert(i) {
                stack.extend(
                    self.entries[i]
                        .depends_on
                        .iter()
                        .map(|dep| index[dep.as_str()]),
                );
            }
        }

        Ok(Self {
            name: self.name.clone(),
            entries: keep
                .into_iter()
                .map(|i| self.entries[i].clone())
                .collect(),
        })
    }

    /// Map step names to positions, rejecting duplicates and unknown dependencies
    fn index(&self) -> Result<HashMap<&str, usize>, PlanError> {
        let mut index = HashMap::with_capacity(self.entries.len());
        for (i, entry) in self.entries.iter().enumerate() {
            if index.insert(entry.name(), i).is_some() {
                return Err(PlanError::DuplicateName {
                    name: entry.name().to_string(),
                });
            }
        }

        for entry in &self.entries {
            if let Some(missing) = entry
                .depends_on
                .iter()
                .find(|dep| !index.contains_key(dep.as_str()))
            {
                return Err(PlanError::DanglingDependency {
                    step: entry.name().to_string(),
                    dependency: missing.clone(),
                });
            }
        }

        Ok(index)
    }
}
