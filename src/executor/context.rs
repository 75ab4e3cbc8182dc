// Per (task, host) execution context

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use super::runner::{ProcessRunner, RunOptions, SharedSink};
use super::ssh::ConnectionManager;
use super::sync::{FileSync, SyncOptions, SyncResult};
use super::{CommandOutput, Connection};
use crate::config::Vars;
use crate::output::errors::ArmadaError;
use crate::registry::Host;

/// Scoped state for one task execution on one host.
///
/// Created immediately before the work unit runs and discarded after. The
/// vars snapshot is the global configuration deep-merged with the host's
/// overrides; the scratch bag is private to this execution.
#[derive(Clone)]
pub struct ExecutionContext {
    pub host: Arc<Host>,
    pub task_name: String,
    vars: Arc<Vars>,
    scratch: Arc<RwLock<Vars>>,
    connections: Arc<ConnectionManager>,
    runner: ProcessRunner,
    sink: Option<SharedSink>,
}

impl ExecutionContext {
    pub fn new(
        host: Arc<Host>,
        task_name: impl Into<String>,
        globals: &Vars,
        connections: Arc<ConnectionManager>,
        runner: ProcessRunner,
    ) -> Self {
        let mut vars = globals.clone();
        vars.merge(host.vars.clone());

        ExecutionContext {
            host,
            task_name: task_name.into(),
            vars: Arc::new(vars),
            scratch: Arc::new(RwLock::new(Vars::new())),
            connections,
            runner,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// The connection for this context's host, opened on first use.
    /// Local hosts (and local-mode tasks, which target the controller) never
    /// dial out.
    pub fn connection(&self) -> Result<Arc<dyn Connection>, ArmadaError> {
        self.connections.open(&self.host)
    }

    /// Run a command on this host; non-zero exit is an error
    pub async fn run(&self, command: &str) -> Result<CommandOutput, ArmadaError> {
        self.run_with(command, RunOptions::new()).await
    }

    /// Run a command with explicit options
    pub async fn run_with(
        &self,
        command: &str,
        mut options: RunOptions,
    ) -> Result<CommandOutput, ArmadaError> {
        if options.sink.is_none() {
            options.sink = self.sink.clone();
        }
        let conn = self.connection()?;
        self.runner.run(conn.as_ref(), command, &options).await
    }

    /// Run a command, returning the result even on non-zero exit
    pub async fn run_tolerant(&self, command: &str) -> Result<CommandOutput, ArmadaError> {
        let mut options = RunOptions::new();
        options.sink = self.sink.clone();
        let conn = self.connection()?;
        self.runner.run_tolerant(conn.as_ref(), command, &options).await
    }

    /// Sync a local tree to a path on this host
    pub async fn sync(
        &self,
        local: PathBuf,
        remote: &str,
        options: &SyncOptions,
    ) -> Result<SyncResult, ArmadaError> {
        let conn = self.connection()?;
        FileSync::new(self.runner.clone())
            .sync(conn.as_ref(), &local, remote, options)
            .await
    }

    /// Read a variable: scratch first, then the merged configuration snapshot
    pub fn var(&self, key: &str) -> Option<serde_yaml::Value> {
        if let Some(value) = self.scratch.read().get(key) {
            return Some(value.clone());
        }
        self.vars.get(key).cloned()
    }

    pub fn has_var(&self, key: &str) -> bool {
        self.scratch.read().has(key) || self.vars.has(key)
    }

    /// Set a scratch variable scoped to this execution
    pub fn set_var(&self, key: impl Into<String>, value: serde_yaml::Value) {
        self.scratch.write().set(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ExecutionContext {
        let host = Host::new("ctl")
            .with_address("127.0.0.1")
            .with_var("workers", serde_yaml::Value::Number(8.into()));

        let mut globals = Vars::new();
        globals.set("workers", serde_yaml::Value::Number(2.into()));
        globals.set(
            "deploy_root",
            serde_yaml::Value::String("/srv/app".to_string()),
        );

        ExecutionContext::new(
            Arc::new(host),
            "deploy",
            &globals,
            Arc::new(ConnectionManager::new()),
            ProcessRunner::default(),
        )
    }

    #[test]
    fn test_host_vars_override_globals() {
        let ctx = context();
        assert_eq!(ctx.var("workers"), Some(serde_yaml::Value::Number(8.into())));
        assert_eq!(
            ctx.var("deploy_root"),
            Some(serde_yaml::Value::String("/srv/app".to_string()))
        );
    }

    #[test]
    fn test_scratch_shadows_snapshot() {
        let ctx = context();
        ctx.set_var("workers", serde_yaml::Value::Number(16.into()));
        assert_eq!(
            ctx.var("workers"),
            Some(serde_yaml::Value::Number(16.into()))
        );
        assert!(ctx.has_var("workers"));
        assert!(!ctx.has_var("missing"));
    }

    #[tokio::test]
    async fn test_run_through_local_host() {
        let ctx = context();
        let output = ctx.run("echo from-context").await.unwrap();
        assert!(output.stdout.contains("from-context"));
    }

    #[tokio::test]
    async fn test_run_tolerant_keeps_failure() {
        let ctx = context();
        let output = ctx.run_tolerant("exit 4").await.unwrap();
        assert_eq!(output.exit_code, 4);
    }
}
