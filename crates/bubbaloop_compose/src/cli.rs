//! Command-line interface for bubbaloop-compose

use crate::runtime::GatePolicy;
use argh::FromArgs;
use std::path::PathBuf;
use std::time::Duration;

/// Health-gated supervisor for compose-style service graphs
#[derive(FromArgs, Debug)]
pub struct ComposeArgs {
    /// services to start together with their dependencies (default: all)
    #[argh(positional)]
    pub services: Vec<String>,

    /// path to the compose file (default: compose.yaml, docker-compose.yml, ...)
    #[argh(option, short = 'f')]
    pub file: Option<PathBuf>,

    /// project directory (default: the compose file's directory)
    #[argh(option)]
    pub project_dir: Option<PathBuf>,

    /// longest a service may wait on its dependencies, e.g. 2m (default: forever)
    #[argh(option, from_str_fn(parse_timeout))]
    pub startup_timeout: Option<Duration>,

    /// what dependents of a failed dependency do: abort or wait (default: abort)
    #[argh(option, default = "GatePolicy::Abort", from_str_fn(parse_policy))]
    pub dependency_policy: GatePolicy,

    /// show launch plan without executing
    #[argh(switch)]
    pub dry_run: bool,

    /// validate compose file and exit
    #[argh(switch)]
    pub validate: bool,

    /// print the final status report as JSON
    #[argh(switch)]
    pub json: bool,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Parse a startup timeout (seconds or a duration such as `2m`)
fn parse_timeout(s: &str) -> Result<Duration, String> {
    let duration = crate::config::parse_duration(s)?;
    if duration.is_zero() {
        return Err("startup timeout must be greater than zero".to_string());
    }
    Ok(duration)
}

/// Parse the dependency policy
fn parse_policy(s: &str) -> Result<GatePolicy, String> {
    s.parse()
}

impl ComposeArgs {
    /// Log filter for env_logger, falling back to `info` on unknown levels
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "error" => "error",
            "warn" => "warn",
            "info" => "info",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }
}
