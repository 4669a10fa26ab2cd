//! Resolved, immutable service descriptions

use crate::config::{
    describe_value, load_env_file, DependencyCondition, HealthcheckTest,
    RestartPolicy, ServiceConfig, DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_RETRIES,
    DEFAULT_PROBE_TIMEOUT,
};
use crate::runtime::graph::GraphError;
use crate::runtime::probe::{ProbeCommand, ProbeSpec};
use crate::runtime::process::ProcessConfig;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Base restart delay when a service does not declare one
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Grace period between SIGTERM and SIGKILL when a service does not declare one
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// A directed requirement that `dependent` waits on `dependency`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyEdge {
    pub dependent: String,
    pub dependency: String,
    pub condition: DependencyCondition,
}

/// A fully resolved service, immutable for the lifetime of the supervisor
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Service name
    pub name: String,
    /// Argument vector to launch
    pub command: Vec<String>,
    /// Environment after `env_file` and `environment` are merged
    pub env: IndexMap<String, String>,
    /// Working directory for the process and its probe
    pub working_dir: Option<PathBuf>,
    /// Declared dependency edges
    pub dependencies: Vec<DependencyEdge>,
    /// Restart policy
    pub restart: RestartPolicy,
    /// Restart budget (None = unbounded)
    pub max_restarts: Option<u32>,
    /// Base restart delay
    pub restart_backoff: Duration,
    /// Time between SIGTERM and SIGKILL
    pub stop_timeout: Duration,
    /// Readiness probe
    pub probe: Option<ProbeSpec>,
    /// Network membership (pass-through)
    pub networks: Vec<String>,
    /// Port mappings (pass-through)
    pub ports: Vec<String>,
    /// Volume mounts (pass-through)
    pub volumes: Vec<String>,
}

impl ServiceSpec {
    /// Minimal spec for a command, mostly useful when building graphs in code
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            env: IndexMap::new(),
            working_dir: None,
            dependencies: Vec::new(),
            restart: RestartPolicy::Never,
            max_restarts: None,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            probe: None,
            networks: Vec::new(),
            ports: Vec::new(),
            volumes: Vec::new(),
        }
    }

    /// Add a dependency edge
    pub fn depends_on(mut self, dependency: impl Into<String>, condition: DependencyCondition) -> Self {
        self.dependencies.push(DependencyEdge {
            dependent: self.name.clone(),
            dependency: dependency.into(),
            condition,
        });
        self
    }

    /// Attach a readiness probe
    pub fn with_probe(mut self, probe: ProbeSpec) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Resolve a compose service definition
    ///
    /// Relative `env_file` and `working_dir` paths are taken from `project_dir`.
    pub fn resolve(
        name: &str,
        config: &ServiceConfig,
        project_dir: &Path,
    ) -> Result<Self, GraphError> {
        let command = config
            .command
            .as_ref()
            .map(|c| c.argv())
            .unwrap_or_default();

        // env_file first, then environment on top
        let mut env = IndexMap::new();
        for file in config.env_file.to_vec() {
            let path = project_dir.join(&file);
            let vars = load_env_file(&path).map_err(|source| GraphError::EnvFile {
                service: name.to_string(),
                source,
            })?;
            env.extend(vars);
        }
        for (key, value) in config.environment.entries() {
            match value.or_else(|| std::env::var(&key).ok()) {
                Some(value) => {
                    env.insert(key, value);
                }
                None => log::debug!("[{}] '{}' is not set on the host, skipping", name, key),
            }
        }

        let working_dir = Some(match &config.working_dir {
            Some(dir) => project_dir.join(dir),
            None => project_dir.to_path_buf(),
        });

        let dependencies = config
            .depends_on
            .entries()
            .into_iter()
            .map(|(dependency, condition)| DependencyEdge {
                dependent: name.to_string(),
                dependency,
                condition,
            })
            .collect();

        let probe = config
            .healthcheck
            .as_ref()
            .filter(|hc| !hc.is_disabled())
            .and_then(|hc| {
                let command = match hc.test.as_ref()? {
                    HealthcheckTest::Shell(line) => ProbeCommand::Shell(line.clone()),
                    HealthcheckTest::List(list) => match list.first().map(String::as_str) {
                        Some("CMD") => ProbeCommand::Exec(list[1..].to_vec()),
                        _ => ProbeCommand::Shell(list[1..].join(" ")),
                    },
                };
                Some(ProbeSpec {
                    command,
                    interval: hc.interval.unwrap_or(DEFAULT_PROBE_INTERVAL),
                    timeout: hc.timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT),
                    retries: hc.retries.unwrap_or(DEFAULT_PROBE_RETRIES),
                    start_period: hc.start_period.unwrap_or_default(),
                    start_interval: hc.start_interval,
                    success_threshold: hc.success_threshold.unwrap_or(1),
                    env: env.clone(),
                    working_dir: working_dir.clone(),
                })
            });

        Ok(Self {
            name: name.to_string(),
            command,
            env,
            working_dir,
            dependencies,
            restart: config.restart,
            max_restarts: config.max_restarts,
            restart_backoff: config.restart_backoff.unwrap_or(DEFAULT_RESTART_BACKOFF),
            stop_timeout: config.stop_grace_period.unwrap_or(DEFAULT_STOP_TIMEOUT),
            probe,
            networks: config.networks.names(),
            ports: config.ports.iter().map(describe_value).collect(),
            volumes: config.volumes.iter().map(describe_value).collect(),
        })
    }

    /// Process configuration for launching this service
    pub fn process_config(&self) -> ProcessConfig {
        ProcessConfig {
            name: self.name.clone(),
            executable: self.command.first().cloned().unwrap_or_default(),
            args: self.command.iter().skip(1).cloned().collect(),
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
        }
    }
}
