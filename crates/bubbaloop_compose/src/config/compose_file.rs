//! Compose file YAML schema definitions

use crate::config::env_file::{load_env_file, EnvFileError};
use crate::config::interpolation::{InterpolationError, Interpolator};
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File names probed when no compose file is given explicitly
pub const DEFAULT_FILE_NAMES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Default time between two health probes
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);
/// Default time a single health probe may take
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default number of consecutive failures before a service is unhealthy
pub const DEFAULT_PROBE_RETRIES: u32 = 3;

/// Root compose file configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ComposeFile {
    /// Project name
    #[serde(default)]
    pub name: Option<String>,

    /// Legacy format version (informational only)
    #[serde(default)]
    pub version: Option<String>,

    /// Service definitions (ordered map for deterministic launch order)
    pub services: IndexMap<String, ServiceConfig>,

    /// Named networks, passed through untouched
    #[serde(default)]
    pub networks: IndexMap<String, serde_yaml::Value>,

    /// Named volumes, passed through untouched
    #[serde(default)]
    pub volumes: IndexMap<String, serde_yaml::Value>,
}

/// Service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Image reference (informational, images are never built or pulled)
    #[serde(default)]
    pub image: Option<String>,

    /// Launch directive
    #[serde(default)]
    pub command: Option<CommandSpec>,

    /// Environment variables specific to this service
    #[serde(default)]
    pub environment: EnvironmentSpec,

    /// Env files loaded before `environment`, relative to the project directory
    #[serde(default)]
    pub env_file: OneOrMany,

    /// Working directory for the process
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Dependencies and the condition each one must reach
    #[serde(default)]
    pub depends_on: DependsOn,

    /// Readiness probe
    #[serde(default)]
    pub healthcheck: Option<HealthcheckConfig>,

    /// Restart policy
    #[serde(default)]
    pub restart: RestartPolicy,

    /// Restart budget; exceeding it is a terminal failure
    #[serde(default)]
    pub max_restarts: Option<u32>,

    /// Base delay before a restart, doubled on every consecutive restart
    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    pub restart_backoff: Option<Duration>,

    /// Time between SIGTERM and SIGKILL on shutdown
    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    pub stop_grace_period: Option<Duration>,

    /// Network membership
    #[serde(default)]
    pub networks: NetworkRefs,

    /// Port mappings, passed through untouched
    #[serde(default)]
    pub ports: Vec<serde_yaml::Value>,

    /// Volume mounts, passed through untouched
    #[serde(default)]
    pub volumes: Vec<serde_yaml::Value>,
}

/// A command can be a shell string or an argument vector
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    /// Run through `sh -c`
    Shell(String),
    /// Executed directly
    Exec(Vec<String>),
}

impl CommandSpec {
    /// Argument vector, with shell strings wrapped in `sh -c`
    pub fn argv(&self) -> Vec<String> {
        match self {
            CommandSpec::Shell(line) => vec!["sh".to_string(), "-c".to_string(), line.clone()],
            CommandSpec::Exec(argv) => argv.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            CommandSpec::Shell(line) => line.trim().is_empty(),
            CommandSpec::Exec(argv) => argv.is_empty(),
        }
    }
}

/// Helper for fields that accept a single string or a list of strings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    /// All values in declaration order
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            OneOrMany::None => Vec::new(),
            OneOrMany::One(value) => vec![value.clone()],
            OneOrMany::Many(values) => values.clone(),
        }
    }
}

/// Environment values can be strings, booleans, or numbers
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl EnvValue {
    /// Convert to string representation
    pub fn as_string(&self) -> String {
        match self {
            EnvValue::Bool(b) => b.to_string(),
            EnvValue::Int(i) => i.to_string(),
            EnvValue::Float(f) => f.to_string(),
            EnvValue::String(s) => s.clone(),
        }
    }
}

/// `environment` accepts a mapping or a list of `KEY=VALUE` entries
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentSpec {
    Map(IndexMap<String, Option<EnvValue>>),
    List(Vec<String>),
}

impl Default for EnvironmentSpec {
    fn default() -> Self {
        EnvironmentSpec::Map(IndexMap::new())
    }
}

impl EnvironmentSpec {
    /// Entries in declaration order; `None` means "inherit from the host"
    pub fn entries(&self) -> Vec<(String, Option<String>)> {
        match self {
            EnvironmentSpec::Map(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.as_ref().map(EnvValue::as_string)))
                .collect(),
            EnvironmentSpec::List(items) => items
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => (item.clone(), None),
                })
                .collect(),
        }
    }
}

/// Dependency declaration: a list of names or a map of name to condition
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    /// Simple dependencies: just the service names (`service_started`)
    List(Vec<String>),
    /// Conditional dependencies: `{ name: { condition: ... } }`
    Map(IndexMap<String, DependsOnEntry>),
}

impl Default for DependsOn {
    fn default() -> Self {
        DependsOn::List(Vec::new())
    }
}

impl DependsOn {
    /// Dependency names with their required condition
    pub fn entries(&self) -> Vec<(String, DependencyCondition)> {
        match self {
            DependsOn::List(names) => names
                .iter()
                .map(|name| (name.clone(), DependencyCondition::ServiceStarted))
                .collect(),
            DependsOn::Map(map) => map
                .iter()
                .map(|(name, entry)| (name.clone(), entry.condition))
                .collect(),
        }
    }
}

/// Long-form dependency entry
#[derive(Debug, Clone, Deserialize)]
pub struct DependsOnEntry {
    #[serde(default)]
    pub condition: DependencyCondition,
}

/// Condition for a dependency to be satisfied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// Dependency process has been launched
    #[default]
    ServiceStarted,
    /// Dependency readiness probe has reported healthy
    ServiceHealthy,
    /// Dependency ran to completion with exit code 0
    ServiceCompletedSuccessfully,
}

impl std::fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyCondition::ServiceStarted => write!(f, "service_started"),
            DependencyCondition::ServiceHealthy => write!(f, "service_healthy"),
            DependencyCondition::ServiceCompletedSuccessfully => {
                write!(f, "service_completed_successfully")
            }
        }
    }
}

/// Healthcheck declaration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthcheckConfig {
    /// `["CMD", ...]`, `["CMD-SHELL", "..."]`, `["NONE"]` or a shell string
    #[serde(default)]
    pub test: Option<HealthcheckTest>,

    /// Disable an inherited healthcheck
    #[serde(default)]
    pub disable: bool,

    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    pub interval: Option<Duration>,

    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    pub timeout: Option<Duration>,

    /// Consecutive failures before the service is unhealthy
    #[serde(default)]
    pub retries: Option<u32>,

    /// Grace period during which failures are not counted
    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    pub start_period: Option<Duration>,

    /// Probe interval inside the start period; without it probing waits for the period to end
    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    pub start_interval: Option<Duration>,

    /// Consecutive successes before the service is healthy
    #[serde(default)]
    pub success_threshold: Option<u32>,
}

/// Healthcheck test forms
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    Shell(String),
    List(Vec<String>),
}

impl HealthcheckConfig {
    /// Whether this healthcheck turns probing off
    pub fn is_disabled(&self) -> bool {
        self.disable
            || matches!(&self.test, Some(HealthcheckTest::List(list))
                if list.first().map(String::as_str) == Some("NONE"))
    }

    fn validate(&self, service: &str) -> Result<(), ComposeFileError> {
        if self.is_disabled() {
            return Ok(());
        }

        let invalid = |msg: &str| {
            Err(ComposeFileError::Validation(format!(
                "Service '{}': healthcheck {}",
                service, msg
            )))
        };

        match &self.test {
            None => return invalid("requires 'test'"),
            Some(HealthcheckTest::Shell(line)) if line.trim().is_empty() => {
                return invalid("'test' is empty")
            }
            Some(HealthcheckTest::List(list)) => match list.first().map(String::as_str) {
                Some("CMD") | Some("CMD-SHELL") if list.len() > 1 => {}
                Some("CMD") | Some("CMD-SHELL") => return invalid("'test' has no command"),
                Some(other) => {
                    return invalid(&format!(
                        "'test' must start with CMD, CMD-SHELL or NONE, got '{}'",
                        other
                    ))
                }
                None => return invalid("'test' is empty"),
            },
            Some(HealthcheckTest::Shell(_)) => {}
        }

        if self.retries == Some(0) {
            return invalid("'retries' must be at least 1");
        }
        if self.success_threshold == Some(0) {
            return invalid("'success_threshold' must be at least 1");
        }
        if self.interval.is_some_and(|d| d.is_zero()) {
            return invalid("'interval' must be greater than zero");
        }
        if self.timeout.is_some_and(|d| d.is_zero()) {
            return invalid("'timeout' must be greater than zero");
        }
        if self.start_interval.is_some_and(|d| d.is_zero()) {
            return invalid("'start_interval' must be greater than zero");
        }

        Ok(())
    }
}

/// Restart policy for a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum RestartPolicy {
    /// Never restart (default)
    #[default]
    #[serde(rename = "no", alias = "never")]
    Never,
    /// Always restart on exit
    #[serde(rename = "always")]
    Always,
    /// Only restart on failure (non-zero exit code or signal)
    #[serde(rename = "on-failure", alias = "on_failure")]
    OnFailure,
    /// Like `always`; there is no persisted stop state to honour
    #[serde(rename = "unless-stopped")]
    UnlessStopped,
}

impl RestartPolicy {
    /// Whether a process that exited with `code` should be restarted
    pub fn should_restart(&self, code: Option<i32>) -> bool {
        match self {
            RestartPolicy::Never => false,
            RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
            RestartPolicy::OnFailure => code != Some(0),
        }
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::Never => write!(f, "no"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
            RestartPolicy::UnlessStopped => write!(f, "unless-stopped"),
        }
    }
}

/// Network membership: a list of names or a map of name to options
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NetworkRefs {
    List(Vec<String>),
    Map(IndexMap<String, serde_yaml::Value>),
}

impl Default for NetworkRefs {
    fn default() -> Self {
        NetworkRefs::List(Vec::new())
    }
}

impl NetworkRefs {
    /// Referenced network names
    pub fn names(&self) -> Vec<String> {
        match self {
            NetworkRefs::List(names) => names.clone(),
            NetworkRefs::Map(map) => map.keys().cloned().collect(),
        }
    }
}

/// Named volume referenced by a mount, if any
///
/// Bind mounts (paths starting with `/`, `.` or `~`) and anonymous volumes
/// return `None`.
pub fn named_volume(mount: &serde_yaml::Value) -> Option<String> {
    let source = match mount {
        serde_yaml::Value::String(short) => {
            let (source, _) = short.split_once(':')?;
            source.to_string()
        }
        serde_yaml::Value::Mapping(_) => {
            if mount.get("type").and_then(|t| t.as_str()).unwrap_or("volume") != "volume" {
                return None;
            }
            mount.get("source")?.as_str()?.to_string()
        }
        _ => return None,
    };

    if source.is_empty() || source.starts_with(['/', '.', '~']) {
        return None;
    }
    Some(source)
}

/// Render an opaque pass-through value on a single line
pub fn describe_value(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => "~".to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| format!("{:?}", other)),
    }
}

impl ComposeFile {
    /// Locate a compose file in `dir` using the default file names
    pub fn find(dir: &Path) -> Option<PathBuf> {
        DEFAULT_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    }

    /// Like [`ComposeFile::find`], but a missing file is an error
    pub fn locate(dir: &Path) -> Result<PathBuf, ComposeFileError> {
        Self::find(dir).ok_or_else(|| ComposeFileError::NotFound {
            dir: dir.display().to_string(),
        })
    }

    /// Load a compose file, interpolating variables from the sibling `.env`
    /// file and the process environment
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ComposeFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ComposeFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let mut interpolator = Interpolator::new();
        let dotenv = path.parent().unwrap_or_else(|| Path::new(".")).join(".env");
        if dotenv.is_file() {
            log::debug!("Loading variables from {}", dotenv.display());
            interpolator = interpolator.with_vars(load_env_file(&dotenv)?);
        }

        Self::from_yaml_with(&content, &interpolator)
    }

    /// Parse a compose file from a YAML string using the process environment
    pub fn from_yaml(content: &str) -> Result<Self, ComposeFileError> {
        Self::from_yaml_with(content, &Interpolator::new())
    }

    /// Parse a compose file from a YAML string with an explicit interpolator
    pub fn from_yaml_with(
        content: &str,
        interpolator: &Interpolator,
    ) -> Result<Self, ComposeFileError> {
        let mut value: serde_yaml::Value = serde_yaml::from_str(content)?;
        interpolator.interpolate_value(&mut value)?;

        let compose_file: ComposeFile = serde_yaml::from_value(value)?;
        compose_file.validate()?;
        Ok(compose_file)
    }

    /// Validate the compose file configuration
    pub fn validate(&self) -> Result<(), ComposeFileError> {
        if self.services.is_empty() {
            return Err(ComposeFileError::Validation(
                "No services defined".to_string(),
            ));
        }

        for (name, service) in &self.services {
            match &service.command {
                Some(command) if !command.is_empty() => {}
                _ => {
                    return Err(ComposeFileError::Validation(format!(
                        "Service '{}': must specify a non-empty 'command'",
                        name
                    )));
                }
            }

            if let Some(healthcheck) = &service.healthcheck {
                healthcheck.validate(name)?;
            }

            // Check that dependencies reference existing services
            for (dep_name, _) in service.depends_on.entries() {
                if !self.services.contains_key(&dep_name) {
                    return Err(ComposeFileError::Validation(format!(
                        "Service '{}': depends on undefined service '{}'",
                        name, dep_name
                    )));
                }
            }

            for network in service.networks.names() {
                if network != "default" && !self.networks.contains_key(&network) {
                    return Err(ComposeFileError::Validation(format!(
                        "Service '{}': refers to undefined network '{}'",
                        name, network
                    )));
                }
            }

            for volume in service.volumes.iter().filter_map(named_volume) {
                if !self.volumes.contains_key(&volume) {
                    return Err(ComposeFileError::Validation(format!(
                        "Service '{}': refers to undefined volume '{}'",
                        name, volume
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Errors that can occur when loading a compose file
#[derive(Debug, thiserror::Error)]
pub enum ComposeFileError {
    #[error("Failed to read compose file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "No compose file found in '{dir}' (looked for {})",
        DEFAULT_FILE_NAMES.join(", ")
    )]
    NotFound { dir: String },

    #[error("Failed to parse compose file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Interpolation failed: {0}")]
    Interpolation(#[from] InterpolationError),

    #[error("Failed to load project .env: {0}")]
    EnvFile(#[from] EnvFileError),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Duration fields accept humantime strings ("10s", "1m30s") or seconds
pub(crate) mod duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Fractional(f64),
        Text(String),
    }

    /// Longest accepted duration (ten years)
    pub const MAX: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

    fn bounded(duration: Duration, input: &str) -> Result<Duration, String> {
        if duration > MAX {
            return Err(format!(
                "duration '{}' is too long (at most {})",
                input,
                humantime::format_duration(MAX)
            ));
        }
        Ok(duration)
    }

    /// Parse a humantime duration string; a bare number means seconds
    pub fn parse(input: &str) -> Result<Duration, String> {
        let input = input.trim();
        if let Ok(secs) = input.parse::<u64>() {
            return bounded(Duration::from_secs(secs), input);
        }
        let duration = humantime::parse_duration(input)
            .map_err(|e| format!("invalid duration '{}': {}", input, e))?;
        bounded(duration, input)
    }

    pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<RawDuration> = Option::deserialize(deserializer)?;
        raw.map(|raw| match raw {
            RawDuration::Seconds(secs) => bounded(Duration::from_secs(secs), &secs.to_string()),
            RawDuration::Fractional(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|e| format!("invalid duration '{}': {}", secs, e))
                .and_then(|duration| bounded(duration, &secs.to_string())),
            RawDuration::Text(text) => parse(&text),
        })
        .transpose()
        .map_err(serde::de::Error::custom)
    }
}
