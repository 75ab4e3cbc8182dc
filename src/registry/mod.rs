// Host registry and selector resolution

use std::collections::HashMap;

use crate::output::errors::ArmadaError;

/// A single remote target
#[derive(Debug, Clone)]
pub struct Host {
    pub alias: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    /// Path to a private key, if one is pinned for this host
    pub identity: Option<String>,
    pub roles: Vec<String>,
    pub stage: Option<String>,
    /// Per-host configuration overrides, deep-merged over the globals
    pub vars: serde_yaml::Mapping,
    /// Upper bound on simultaneous task executions for this host
    pub max_parallel: Option<usize>,
}

impl Host {
    pub fn new(alias: impl Into<String>) -> Self {
        let alias = alias.into();
        Host {
            address: alias.clone(),
            alias,
            port: 22,
            user: String::new(),
            identity: None,
            roles: Vec::new(),
            stage: None,
            vars: serde_yaml::Mapping::new(),
            max_parallel: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_identity(mut self, path: impl Into<String>) -> Self {
        self.identity = Some(path.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = Some(max);
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: serde_yaml::Value) -> Self {
        self.vars
            .insert(serde_yaml::Value::String(key.into()), value);
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// The SSH connection string (user@host:port)
    pub fn ssh_target(&self) -> String {
        if self.user.is_empty() {
            format!("{}:{}", self.address, self.port)
        } else {
            format!("{}@{}:{}", self.user, self.address, self.port)
        }
    }

    /// Check if this host should use local execution instead of SSH
    pub fn is_local(&self) -> bool {
        self.address == "localhost" || self.address == "127.0.0.1" || self.address == "::1"
    }
}

/// Ordered registry of named remote targets
///
/// Registration order is observable: selector resolution and `once`-task host
/// choice both follow it.
#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    hosts: Vec<Host>,
    index: HashMap<String, usize>,
}

impl HostRegistry {
    pub fn new() -> Self {
        HostRegistry::default()
    }

    /// Register a host. The alias must be unique.
    pub fn register(&mut self, host: Host) -> Result<(), ArmadaError> {
        if self.index.contains_key(&host.alias) {
            return Err(ArmadaError::DuplicateHost {
                alias: host.alias.clone(),
            });
        }
        self.index.insert(host.alias.clone(), self.hosts.len());
        self.hosts.push(host);
        Ok(())
    }

    /// Resolve a selector expression to an ordered set of hosts.
    ///
    /// Matching precedence: exact alias, then stage, then role, then the
    /// literal "all" wildcard. The result preserves registration order and an
    /// empty match is an error.
    pub fn resolve(&self, selector: &str) -> Result<Vec<Host>, ArmadaError> {
        if let Some(&idx) = self.index.get(selector) {
            return Ok(vec![self.hosts[idx].clone()]);
        }

        let by_stage: Vec<Host> = self
            .hosts
            .iter()
            .filter(|h| h.stage.as_deref() == Some(selector))
            .cloned()
            .collect();
        if !by_stage.is_empty() {
            return Ok(by_stage);
        }

        let by_role: Vec<Host> = self
            .hosts
            .iter()
            .filter(|h| h.has_role(selector))
            .cloned()
            .collect();
        if !by_role.is_empty() {
            return Ok(by_role);
        }

        if selector == "all" && !self.hosts.is_empty() {
            return Ok(self.hosts.to_vec());
        }

        Err(ArmadaError::UnknownSelector {
            selector: selector.to_string(),
            suggestion: self.suggest(selector),
        })
    }

    /// Look up a single host by alias
    pub fn get(&self, alias: &str) -> Option<&Host> {
        self.index.get(alias).map(|&idx| &self.hosts[idx])
    }

    /// All hosts in registration order
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    fn suggest(&self, selector: &str) -> Option<String> {
        if self.hosts.is_empty() {
            return Some("the registry is empty; check your hosts configuration".to_string());
        }

        // Offer the nearest alias by prefix, otherwise list the known stages
        if let Some(host) = self
            .hosts
            .iter()
            .find(|h| h.alias.starts_with(selector) || selector.starts_with(&h.alias))
        {
            return Some(format!("did you mean '{}'?", host.alias));
        }

        let mut stages: Vec<&str> = self
            .hosts
            .iter()
            .filter_map(|h| h.stage.as_deref())
            .collect();
        stages.sort_unstable();
        stages.dedup();

        if stages.is_empty() {
            None
        } else {
            Some(format!("known stages: {}", stages.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet() -> HostRegistry {
        let mut reg = HostRegistry::new();
        reg.register(
            Host::new("web1")
                .with_address("10.0.0.1")
                .with_role("web")
                .with_stage("production"),
        )
        .unwrap();
        reg.register(
            Host::new("web2")
                .with_address("10.0.0.2")
                .with_role("web")
                .with_stage("production"),
        )
        .unwrap();
        reg.register(
            Host::new("db1")
                .with_address("10.0.0.3")
                .with_role("db")
                .with_stage("production"),
        )
        .unwrap();
        reg.register(
            Host::new("staging1")
                .with_address("10.1.0.1")
                .with_role("web")
                .with_role("db")
                .with_stage("staging"),
        )
        .unwrap();
        reg.register(Host::new("bastion").with_address("10.0.0.254"))
            .unwrap();
        reg
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let mut reg = HostRegistry::new();
        reg.register(Host::new("web1")).unwrap();

        let err = reg.register(Host::new("web1")).unwrap_err();
        assert!(matches!(err, ArmadaError::DuplicateHost { alias } if alias == "web1"));
    }

    #[test]
    fn test_resolve_all_in_registration_order() {
        let reg = fleet();
        let hosts = reg.resolve("all").unwrap();

        let aliases: Vec<&str> = hosts.iter().map(|h| h.alias.as_str()).collect();
        assert_eq!(aliases, vec!["web1", "web2", "db1", "staging1", "bastion"]);
    }

    #[test]
    fn test_resolve_by_role() {
        let reg = fleet();
        let hosts = reg.resolve("db").unwrap();

        let aliases: Vec<&str> = hosts.iter().map(|h| h.alias.as_str()).collect();
        assert_eq!(aliases, vec!["db1", "staging1"]);
    }

    #[test]
    fn test_resolve_by_stage() {
        let reg = fleet();
        let hosts = reg.resolve("staging").unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].alias, "staging1");
    }

    #[test]
    fn test_alias_wins_over_stage_and_role() {
        let mut reg = fleet();
        // A host literally aliased "production" shadows the stage of the same name
        reg.register(Host::new("production").with_address("10.9.9.9"))
            .unwrap();

        let hosts = reg.resolve("production").unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].alias, "production");
    }

    #[test]
    fn test_unknown_selector() {
        let reg = fleet();
        let err = reg.resolve("cache").unwrap_err();
        assert!(matches!(err, ArmadaError::UnknownSelector { selector, .. } if selector == "cache"));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let reg = fleet();
        let first = reg.resolve("web").unwrap();
        let second = reg.resolve("web").unwrap();

        let a: Vec<&str> = first.iter().map(|h| h.alias.as_str()).collect();
        let b: Vec<&str> = second.iter().map(|h| h.alias.as_str()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_registry_all_is_error() {
        let reg = HostRegistry::new();
        assert!(reg.resolve("all").is_err());
    }

    #[test]
    fn test_ssh_target_and_local_detection() {
        let host = Host::new("web1").with_address("10.0.0.1").with_user("deploy");
        assert_eq!(host.ssh_target(), "deploy@10.0.0.1:22");
        assert!(!host.is_local());

        let local = Host::new("ctl").with_address("127.0.0.1");
        assert!(local.is_local());
    }
}
