// Task graph compilation: hook expansion and cycle detection

use std::collections::HashSet;
use std::sync::Arc;

use super::{Task, TaskRegistry};
use crate::output::errors::ArmadaError;

/// A fully resolved, duplicate-free, ordered task sequence
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    requested: String,
    tasks: Vec<Arc<Task>>,
}

impl CompiledPlan {
    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    /// The task name this plan was compiled for (not an expanded hook)
    pub fn requested(&self) -> &str {
        &self.requested
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Compile a requested task name into a linear execution plan.
///
/// Depth-first: a task's "before" hooks are expanded first, then the task
/// itself is emitted, then its "after" hooks. A task already emitted earlier in
/// the same compilation is not re-emitted. Compilation is pure and happens
/// entirely before any host is contacted.
pub fn compile(registry: &TaskRegistry, requested: &str) -> Result<CompiledPlan, ArmadaError> {
    let mut emitted = Vec::new();
    let mut emitted_set = HashSet::new();
    let mut visiting = Vec::new();

    expand(
        registry,
        requested,
        None,
        &mut emitted,
        &mut emitted_set,
        &mut visiting,
    )?;

    Ok(CompiledPlan {
        requested: requested.to_string(),
        tasks: emitted,
    })
}

fn expand(
    registry: &TaskRegistry,
    name: &str,
    referenced_by: Option<&str>,
    emitted: &mut Vec<Arc<Task>>,
    emitted_set: &mut HashSet<String>,
    visiting: &mut Vec<String>,
) -> Result<(), ArmadaError> {
    if emitted_set.contains(name) {
        return Ok(());
    }

    // Re-entering a task that is being expanded but not yet emitted is a cycle
    if let Some(pos) = visiting.iter().position(|n| n == name) {
        let mut path: Vec<String> = visiting[pos..].to_vec();
        path.push(name.to_string());
        return Err(ArmadaError::Cycle { path });
    }

    let task = registry.get(name).ok_or_else(|| ArmadaError::UnknownTask {
        name: name.to_string(),
        referenced_by: referenced_by.map(|s| s.to_string()),
    })?;

    visiting.push(name.to_string());

    for hook in &task.before {
        expand(registry, hook, Some(name), emitted, emitted_set, visiting)?;
    }

    // The hooks above may already have pulled this task in transitively
    if emitted_set.insert(name.to_string()) {
        emitted.push(task.clone());
    }

    for hook in &task.after {
        expand(registry, hook, Some(name), emitted, emitted_set, visiting)?;
    }

    visiting.pop();
    Ok(())
}
