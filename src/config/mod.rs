// Typed configuration store with nested merge semantics

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::executor::sync::SyncOptions;
use crate::output::errors::ArmadaError;
use crate::registry::{Host, HostRegistry};
use crate::tasks::{Task, TaskMode, TaskRegistry};

/// Configuration subsystem errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{0}")]
    Invalid(String),
}

impl From<ConfigError> for ArmadaError {
    fn from(err: ConfigError) -> Self {
        ArmadaError::Config {
            message: err.to_string(),
            path: None,
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_concurrency() -> usize {
    4
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    300
}

fn default_connect_retries() -> u32 {
    3
}

fn default_mode() -> String {
    "normal".to_string()
}

/// One host entry in the config file.
///
/// Hosts are a YAML sequence, not a mapping: registration order is load order
/// and stays observable through selector resolution.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub vars: serde_yaml::Mapping,
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

/// A file-sync step attached to a config-declared task
#[derive(Debug, Clone, Deserialize)]
pub struct SyncStepConfig {
    pub local: String,
    pub remote: String,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub delete: bool,
}

/// One task entry in the config file
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub before: Vec<String>,
    #[serde(default)]
    pub after: Vec<String>,
    /// Shell commands executed in order on the target
    #[serde(default)]
    pub run: Vec<String>,
    /// Optional file sync performed after the commands
    #[serde(default)]
    pub sync: Option<SyncStepConfig>,
}

/// Anonymous usage reporting endpoint. Telemetry is off unless this is set.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    pub endpoint: String,
}

/// The armada.yml document
#[derive(Debug, Clone, Deserialize)]
pub struct ArmadaConfig {
    pub project: String,
    #[serde(default)]
    pub default_stage: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Global variables, deep-merged under each host's overrides
    #[serde(default)]
    pub vars: serde_yaml::Mapping,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    /// Task name (or "*") -> failure hook task names
    #[serde(default)]
    pub on_failure: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
}

impl ArmadaConfig {
    /// Load and parse a config file
    pub fn load(path: &Path) -> Result<Self, ArmadaError> {
        let content = std::fs::read_to_string(path).map_err(|e| ArmadaError::Config {
            message: format!("failed to read config file: {}", e),
            path: Some(path.to_path_buf()),
        })?;
        Self::parse(&content).map_err(|e| ArmadaError::Config {
            message: e.to_string(),
            path: Some(path.to_path_buf()),
        })
    }

    /// Parse a config document from a YAML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ArmadaConfig = serde_yaml::from_str(content)?;
        if config.project.is_empty() {
            return Err(ConfigError::Invalid("'project' must not be empty".into()));
        }
        if config.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "'concurrency' must be at least 1".into(),
            ));
        }
        Ok(config)
    }

    /// Build the host registry in declaration order
    pub fn build_host_registry(&self) -> Result<HostRegistry, ArmadaError> {
        let mut registry = HostRegistry::new();
        for hc in &self.hosts {
            let mut host = Host::new(&hc.name)
                .with_address(hc.address.clone().unwrap_or_else(|| hc.name.clone()))
                .with_port(hc.port);

            if let Some(user) = &hc.user {
                host = host.with_user(user);
            }
            if let Some(identity) = &hc.identity {
                host = host.with_identity(identity);
            }
            if let Some(stage) = &hc.stage {
                host = host.with_stage(stage);
            }
            if let Some(max) = hc.max_parallel {
                host = host.with_max_parallel(max);
            }
            for role in &hc.roles {
                host = host.with_role(role);
            }
            host.vars = hc.vars.clone();

            registry.register(host)?;
        }
        Ok(registry)
    }

    /// Register the config-declared tasks and failure hooks.
    ///
    /// Each task's script lines run in order through the host's connection;
    /// an attached sync step runs afterwards.
    pub fn register_tasks(&self, registry: &mut TaskRegistry) -> Result<(), ArmadaError> {
        for tc in &self.tasks {
            let mode: TaskMode = tc.mode.parse().map_err(|e: String| ArmadaError::Config {
                message: format!("task '{}': {}", tc.name, e),
                path: None,
            })?;

            let mut task = Task::new(&tc.name)
                .with_description(&tc.description)
                .with_mode(mode);
            if tc.private {
                task = task.private();
            }
            for hook in &tc.before {
                task = task.before(hook);
            }
            for hook in &tc.after {
                task = task.after(hook);
            }

            let lines = tc.run.clone();
            let sync = tc.sync.clone();
            task = task.with_work(move |ctx| {
                let lines = lines.clone();
                let sync = sync.clone();
                async move {
                    for line in &lines {
                        ctx.run(line).await?;
                    }
                    if let Some(step) = &sync {
                        let opts = SyncOptions {
                            include: step.include.clone(),
                            exclude: step.exclude.clone(),
                            delete: step.delete,
                            dry_run: false,
                        };
                        ctx.sync(PathBuf::from(&step.local), &step.remote, &opts)
                            .await?;
                    }
                    Ok(())
                }
            });

            registry.register(task)?;
        }

        for (key, hooks) in &self.on_failure {
            registry.on_failure(key.clone(), hooks.clone());
        }

        registry.validate()
    }
}

/// A nested key-value bag with deep-merge semantics
#[derive(Debug, Clone, Default)]
pub struct Vars {
    inner: serde_yaml::Mapping,
}

impl Vars {
    pub fn new() -> Self {
        Vars::default()
    }

    pub fn from_mapping(mapping: serde_yaml::Mapping) -> Self {
        Vars { inner: mapping }
    }

    pub fn get(&self, key: &str) -> Option<&serde_yaml::Value> {
        self.inner.get(serde_yaml::Value::String(key.to_string()))
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_yaml::Value) {
        self.inner
            .insert(serde_yaml::Value::String(key.into()), value);
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Deep-merge another bag over this one (see [`deep_merge`])
    pub fn merge(&mut self, overlay: serde_yaml::Mapping) {
        for (key, value) in overlay {
            match self.inner.get_mut(&key) {
                Some(existing) => deep_merge(existing, value),
                None => {
                    self.inner.insert(key, value);
                }
            }
        }
    }

    pub fn as_mapping(&self) -> &serde_yaml::Mapping {
        &self.inner
    }
}

/// Deep-merge `overlay` into `base`.
///
/// Sequences concatenate, mappings merge recursively, anything else is
/// replaced by the overlay value.
pub fn deep_merge(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Sequence(b), serde_yaml::Value::Sequence(o)) => {
            b.extend(o);
        }
        (serde_yaml::Value::Mapping(b), serde_yaml::Value::Mapping(o)) => {
            for (key, value) in o {
                match b.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        b.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Starter configuration written by `armada init`
pub fn scaffold(project: &str) -> String {
    format!(
        r#"# armada deployment configuration
project: {project}

concurrency: 4
default_stage: production

vars:
  deploy_root: /srv/{project}

hosts:
  - name: web1
    address: web1.example.com
    user: deploy
    roles: [web]
    stage: production
  - name: web2
    address: web2.example.com
    user: deploy
    roles: [web]
    stage: production
  - name: db1
    address: db1.example.com
    user: deploy
    roles: [db]
    stage: production
    max_parallel: 1

tasks:
  - name: deploy
    description: Pull the latest release and restart the service
    before: [build]
    run:
      - cd /srv/{project} && git pull --ff-only
      - systemctl --user restart {project}

  - name: build
    description: Build the release artifact on the controller
    mode: local
    run:
      - make release

  - name: migrate
    description: Run database migrations on one host only
    mode: once
    run:
      - cd /srv/{project} && ./bin/migrate

  - name: rollback
    description: Restore the previously deployed release
    private: true
    run:
      - cd /srv/{project} && git checkout @{{1}}

on_failure:
  deploy: [rollback]
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scaffold_parses() {
        let config = ArmadaConfig::parse(&scaffold("myapp")).unwrap();
        assert_eq!(config.project, "myapp");
        assert_eq!(config.hosts.len(), 3);
        assert_eq!(config.tasks.len(), 4);
        assert!(config.on_failure.contains_key("deploy"));
    }

    #[test]
    fn test_scaffold_round_trips_into_registries() {
        let config = ArmadaConfig::parse(&scaffold("myapp")).unwrap();

        let hosts = config.build_host_registry().unwrap();
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts.resolve("web").unwrap().len(), 2);

        let mut tasks = TaskRegistry::new();
        config.register_tasks(&mut tasks).unwrap();
        assert_eq!(tasks.len(), 4);
        assert_eq!(tasks.get("build").unwrap().mode, TaskMode::Local);
        assert_eq!(tasks.get("migrate").unwrap().mode, TaskMode::Once);
        assert!(tasks.get("rollback").unwrap().private);
    }

    #[test]
    fn test_empty_project_rejected() {
        let err = ArmadaConfig::parse("project: \"\"\n").unwrap_err();
        assert!(err.to_string().contains("project"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = ArmadaConfig::parse("project: x\nconcurrency: 0\n").unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let yaml = r#"
project: x
tasks:
  - name: deploy
    mode: sideways
"#;
        let config = ArmadaConfig::parse(yaml).unwrap();
        let mut reg = TaskRegistry::new();
        assert!(config.register_tasks(&mut reg).is_err());
    }

    #[test]
    fn test_dangling_failure_hook_rejected() {
        let yaml = r#"
project: x
tasks:
  - name: deploy
on_failure:
  deploy: [rollback]
"#;
        let config = ArmadaConfig::parse(yaml).unwrap();
        let mut reg = TaskRegistry::new();
        assert!(config.register_tasks(&mut reg).is_err());
    }

    #[test]
    fn test_deep_merge_scalars_replace() {
        let mut base: serde_yaml::Value = serde_yaml::from_str("a: 1").unwrap();
        let overlay: serde_yaml::Value = serde_yaml::from_str("a: 2").unwrap();
        deep_merge(&mut base, overlay);
        assert_eq!(base, serde_yaml::from_str::<serde_yaml::Value>("a: 2").unwrap());
    }

    #[test]
    fn test_deep_merge_sequences_concatenate() {
        let mut base: serde_yaml::Value = serde_yaml::from_str("[1, 2]").unwrap();
        let overlay: serde_yaml::Value = serde_yaml::from_str("[3]").unwrap();
        deep_merge(&mut base, overlay);
        assert_eq!(
            base,
            serde_yaml::from_str::<serde_yaml::Value>("[1, 2, 3]").unwrap()
        );
    }

    #[test]
    fn test_deep_merge_nested_mappings() {
        let mut base: serde_yaml::Value =
            serde_yaml::from_str("app:\n  port: 80\n  features: [a]").unwrap();
        let overlay: serde_yaml::Value =
            serde_yaml::from_str("app:\n  features: [b]\n  debug: true").unwrap();
        deep_merge(&mut base, overlay);

        let expected: serde_yaml::Value =
            serde_yaml::from_str("app:\n  port: 80\n  features: [a, b]\n  debug: true").unwrap();
        assert_eq!(base, expected);
    }

    #[test]
    fn test_vars_get_set_has() {
        let mut vars = Vars::new();
        assert!(!vars.has("region"));

        vars.set("region", serde_yaml::Value::String("eu-west".into()));
        assert!(vars.has("region"));
        assert_eq!(
            vars.get("region"),
            Some(&serde_yaml::Value::String("eu-west".into()))
        );
    }

    #[test]
    fn test_vars_merge_layers_host_over_global() {
        let global: serde_yaml::Mapping =
            serde_yaml::from_str("deploy_root: /srv/app\nworkers: 2").unwrap();
        let host_overrides: serde_yaml::Mapping = serde_yaml::from_str("workers: 8").unwrap();

        let mut vars = Vars::from_mapping(global);
        vars.merge(host_overrides);

        assert_eq!(
            vars.get("workers"),
            Some(&serde_yaml::Value::Number(8.into()))
        );
        assert_eq!(
            vars.get("deploy_root"),
            Some(&serde_yaml::Value::String("/srv/app".into()))
        );
    }
}
