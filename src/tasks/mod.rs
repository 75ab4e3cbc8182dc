// Task model, registry, and failure-hook table

pub mod compiler;

pub use compiler::{compile, CompiledPlan};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::executor::context::ExecutionContext;
use crate::output::errors::ArmadaError;

/// Wildcard key in the failure-hook table that matches any failing task
pub const ANY_TASK: &str = "*";

/// How a task is placed across the selected host set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskMode {
    /// Run on every selected host
    #[default]
    Normal,
    /// Run on exactly the first selected host
    Once,
    /// Run once on the controller, never opening a remote connection
    Local,
}

impl std::str::FromStr for TaskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(TaskMode::Normal),
            "once" => Ok(TaskMode::Once),
            "local" => Ok(TaskMode::Local),
            other => Err(format!("unknown task mode '{}'", other)),
        }
    }
}

/// The unit of work a task performs on one host
pub type TaskWork =
    Arc<dyn Fn(ExecutionContext) -> BoxFuture<'static, Result<(), ArmadaError>> + Send + Sync>;

/// A named unit of deployment work
///
/// Tasks are created at registration time and immutable afterwards; the
/// registry hands them out as `Arc<Task>`.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub description: String,
    pub mode: TaskMode,
    /// Private tasks cannot be invoked from the command surface, only as hooks
    pub private: bool,
    pub before: Vec<String>,
    pub after: Vec<String>,
    work: TaskWork,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Task {
            name: name.into(),
            description: String::new(),
            mode: TaskMode::Normal,
            private: false,
            before: Vec::new(),
            after: Vec::new(),
            work: Arc::new(|_ctx| Box::pin(async { Ok(()) })),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_mode(mut self, mode: TaskMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn before(mut self, hook: impl Into<String>) -> Self {
        self.before.push(hook.into());
        self
    }

    pub fn after(mut self, hook: impl Into<String>) -> Self {
        self.after.push(hook.into());
        self
    }

    /// Attach the async work function executed per (task, host)
    pub fn with_work<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ArmadaError>> + Send + 'static,
    {
        self.work = Arc::new(move |ctx| Box::pin(f(ctx)));
        self
    }

    /// Run the task's work in the given context
    pub fn run(&self, ctx: ExecutionContext) -> BoxFuture<'static, Result<(), ArmadaError>> {
        (self.work)(ctx)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("private", &self.private)
            .field("before", &self.before)
            .field("after", &self.after)
            .finish()
    }
}

/// Ordered registry of tasks plus the failure-hook table
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Vec<Arc<Task>>,
    index: HashMap<String, usize>,
    /// Task name (or ANY_TASK) -> ordered hook task names, run on failing hosts
    failure_hooks: HashMap<String, Vec<String>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        TaskRegistry::default()
    }

    /// Register a task. Names must be unique.
    pub fn register(&mut self, task: Task) -> Result<(), ArmadaError> {
        if self.index.contains_key(&task.name) {
            return Err(ArmadaError::Config {
                message: format!("task '{}' is already registered", task.name),
                path: None,
            });
        }
        self.index.insert(task.name.clone(), self.tasks.len());
        self.tasks.push(Arc::new(task));
        Ok(())
    }

    /// Record failure hooks for a task name (or ANY_TASK for the wildcard)
    pub fn on_failure(&mut self, task: impl Into<String>, hooks: Vec<String>) {
        self.failure_hooks.insert(task.into(), hooks);
    }

    pub fn get(&self, name: &str) -> Option<Arc<Task>> {
        self.index.get(name).map(|&idx| self.tasks[idx].clone())
    }

    /// All tasks in registration order
    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Resolve the failure hooks for a failed task: the exact entry first,
    /// then the wildcard entry.
    pub fn failure_hooks_for(&self, task: &str) -> Vec<Arc<Task>> {
        let mut hooks = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for key in [task, ANY_TASK] {
            if let Some(names) = self.failure_hooks.get(key) {
                for name in names {
                    if let Some(hook) = self.get(name) {
                        if seen.insert(hook.name.clone()) {
                            hooks.push(hook);
                        }
                    }
                }
            }
        }

        hooks
    }

    /// Check every before/after and failure-hook reference against the
    /// registry, so dangling names fail before any host is contacted.
    pub fn validate(&self) -> Result<(), ArmadaError> {
        for task in &self.tasks {
            for hook in task.before.iter().chain(task.after.iter()) {
                if !self.index.contains_key(hook) {
                    return Err(ArmadaError::UnknownTask {
                        name: hook.clone(),
                        referenced_by: Some(task.name.clone()),
                    });
                }
            }
        }

        for (key, hooks) in &self.failure_hooks {
            if key != ANY_TASK && !self.index.contains_key(key) {
                return Err(ArmadaError::UnknownTask {
                    name: key.clone(),
                    referenced_by: Some("on_failure".to_string()),
                });
            }
            for hook in hooks {
                if !self.index.contains_key(hook) {
                    return Err(ArmadaError::UnknownTask {
                        name: hook.clone(),
                        referenced_by: Some(format!("on_failure[{}]", key)),
                    });
                }
            }
        }

        Ok(())
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks)
            .field("failure_hooks", &self.failure_hooks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_task_rejected() {
        let mut reg = TaskRegistry::new();
        reg.register(Task::new("deploy")).unwrap();
        assert!(reg.register(Task::new("deploy")).is_err());
    }

    #[test]
    fn test_failure_hooks_exact_then_wildcard() {
        let mut reg = TaskRegistry::new();
        reg.register(Task::new("deploy")).unwrap();
        reg.register(Task::new("rollback").private()).unwrap();
        reg.register(Task::new("alert").private()).unwrap();

        reg.on_failure("deploy", vec!["rollback".to_string()]);
        reg.on_failure(ANY_TASK, vec!["alert".to_string()]);

        let hooks = reg.failure_hooks_for("deploy");
        let names: Vec<&str> = hooks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["rollback", "alert"]);

        // Non-matching task only gets the wildcard
        let hooks = reg.failure_hooks_for("build");
        let names: Vec<&str> = hooks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["alert"]);
    }

    #[test]
    fn test_failure_hooks_dedup_overlap() {
        let mut reg = TaskRegistry::new();
        reg.register(Task::new("deploy")).unwrap();
        reg.register(Task::new("alert").private()).unwrap();

        reg.on_failure("deploy", vec!["alert".to_string()]);
        reg.on_failure(ANY_TASK, vec!["alert".to_string()]);

        let hooks = reg.failure_hooks_for("deploy");
        assert_eq!(hooks.len(), 1);
    }

    #[test]
    fn test_validate_catches_dangling_hook() {
        let mut reg = TaskRegistry::new();
        reg.register(Task::new("deploy").before("build")).unwrap();

        let err = reg.validate().unwrap_err();
        assert!(matches!(
            err,
            ArmadaError::UnknownTask { name, referenced_by }
                if name == "build" && referenced_by.as_deref() == Some("deploy")
        ));
    }

    #[test]
    fn test_validate_catches_dangling_failure_hook() {
        let mut reg = TaskRegistry::new();
        reg.register(Task::new("deploy")).unwrap();
        reg.on_failure("deploy", vec!["rollback".to_string()]);

        assert!(reg.validate().is_err());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("once".parse::<TaskMode>().unwrap(), TaskMode::Once);
        assert_eq!("local".parse::<TaskMode>().unwrap(), TaskMode::Local);
        assert!("remote".parse::<TaskMode>().is_err());
    }
}
