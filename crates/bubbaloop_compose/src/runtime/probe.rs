//! Readiness probes
//!
//! A probe never fails past its boundary: spawn errors, non-zero exits and
//! timeouts all come back as an unsuccessful [`ProbeResult`].

use async_trait::async_trait;
use indexmap::IndexMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;

/// Probe output kept per result, matching what container runtimes retain
pub const MAX_PROBE_OUTPUT: usize = 4096;

/// What a probe executes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeCommand {
    /// Executed directly (`["CMD", ...]`)
    Exec(Vec<String>),
    /// Run through `sh -c` (`["CMD-SHELL", ...]` or a plain string)
    Shell(String),
}

impl std::fmt::Display for ProbeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeCommand::Exec(argv) => write!(f, "{}", argv.join(" ")),
            ProbeCommand::Shell(line) => write!(f, "sh -c '{}'", line),
        }
    }
}

/// Probe policy, owned by exactly one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    /// Check to execute
    pub command: ProbeCommand,
    /// Time between probes
    pub interval: Duration,
    /// Time a single probe may take before it counts as failed
    pub timeout: Duration,
    /// Consecutive failures before the service is unhealthy
    pub retries: u32,
    /// Grace window after launch during which failures are not counted
    pub start_period: Duration,
    /// Probe interval inside the grace window (None = wait for it to end)
    pub start_interval: Option<Duration>,
    /// Consecutive successes before the service is healthy
    pub success_threshold: u32,
    /// Environment the check runs with
    pub env: IndexMap<String, String>,
    /// Working directory the check runs in
    pub working_dir: Option<PathBuf>,
}

impl ProbeSpec {
    /// Probe with compose defaults (30s interval and timeout, 3 retries)
    pub fn new(command: ProbeCommand) -> Self {
        Self {
            command,
            interval: crate::config::DEFAULT_PROBE_INTERVAL,
            timeout: crate::config::DEFAULT_PROBE_TIMEOUT,
            retries: crate::config::DEFAULT_PROBE_RETRIES,
            start_period: Duration::ZERO,
            start_interval: None,
            success_threshold: 1,
            env: IndexMap::new(),
            working_dir: None,
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn start_period(mut self, start_period: Duration) -> Self {
        self.start_period = start_period;
        self
    }

    pub fn start_interval(mut self, start_interval: Duration) -> Self {
        self.start_interval = Some(start_interval);
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }
}

/// Outcome of one probe execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub success: bool,
    pub duration: Duration,
    /// Exit code of the check, if it ran to completion
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr, or a description of the fault
    pub output: String,
}

impl ProbeResult {
    /// A probe that could not run or did not finish
    pub fn fault(duration: Duration, output: impl Into<String>) -> Self {
        Self {
            success: false,
            duration,
            exit_code: None,
            output: output.into(),
        }
    }
}

/// Executes readiness checks
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    /// Run a single check; never fails, faults become `success = false`
    async fn run(&self, spec: &ProbeSpec) -> ProbeResult;
}

/// Runs probe commands as child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandProbe;

#[async_trait]
impl ProbeRunner for CommandProbe {
    async fn run(&self, spec: &ProbeSpec) -> ProbeResult {
        let started = Instant::now();

        let mut cmd = match &spec.command {
            ProbeCommand::Exec(argv) => {
                let Some((program, args)) = argv.split_first() else {
                    return ProbeResult::fault(started.elapsed(), "probe command is empty");
                };
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
            ProbeCommand::Shell(line) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
        };

        cmd.envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ProbeResult::fault(
                    started.elapsed(),
                    format!("failed to run probe '{}': {}", spec.command, e),
                )
            }
        };

        // Dropping the child on timeout kills it (kill_on_drop)
        match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                ProbeResult {
                    success: output.status.success(),
                    duration: started.elapsed(),
                    exit_code: output.status.code(),
                    output: truncate_output(text),
                }
            }
            Ok(Err(e)) => ProbeResult::fault(
                started.elapsed(),
                format!("error waiting for probe: {}", e),
            ),
            Err(_) => ProbeResult::fault(
                started.elapsed(),
                format!("probe timed out after {:?}", spec.timeout),
            ),
        }
    }
}

fn truncate_output(mut text: String) -> String {
    if text.len() > MAX_PROBE_OUTPUT {
        let mut cut = MAX_PROBE_OUTPUT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}
