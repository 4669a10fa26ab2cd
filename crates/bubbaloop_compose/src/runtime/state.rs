//! Per-service lifecycle state
//!
//! Written only by the service's own supervision task and observed by the
//! dependency gate and the status report through a `watch` channel.

use crate::runtime::process::ProcessExit;
use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::time::Instant;

/// Where a service is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServicePhase {
    /// Not yet handed to the gate
    Pending,
    /// Waiting on its dependencies
    Blocked,
    /// Process is running
    Running,
    /// Process exited and is waiting out its restart backoff
    Restarting,
    /// Process exited and will not be restarted
    Exited,
    /// Terminal failure (restart budget exhausted, spawn error, dependency fault)
    Failed,
    /// Torn down by the supervisor
    Stopped,
}

impl ServicePhase {
    /// Whether the service will never launch again
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ServicePhase::Exited | ServicePhase::Failed | ServicePhase::Stopped
        )
    }
}

impl std::fmt::Display for ServicePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServicePhase::Pending => "pending",
            ServicePhase::Blocked => "blocked",
            ServicePhase::Running => "running",
            ServicePhase::Restarting => "restarting",
            ServicePhase::Exited => "exited",
            ServicePhase::Failed => "failed",
            ServicePhase::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle record of one service
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub phase: ServicePhase,
    /// Number of successful process launches
    pub launches: u32,
    /// Number of restarts performed
    pub restarts: u32,
    /// PID of the running process
    pub pid: Option<u32>,
    /// First launch of the service
    pub first_launched_at: Option<Instant>,
    /// Latest launch of the service
    pub last_launched_at: Option<Instant>,
    /// Wall-clock time of the latest launch, for reporting
    pub launched_wall: Option<DateTime<Local>>,
    /// How the latest process ended
    pub last_exit: Option<ProcessExit>,
    /// The latest process exited with code 0 and has not been relaunched
    pub completed_ok: bool,
    /// Reason for a `Failed` phase
    pub fault: Option<String>,
    /// When the supervisor tore the service down
    pub stopped_at: Option<Instant>,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            phase: ServicePhase::Pending,
            launches: 0,
            restarts: 0,
            pid: None,
            first_launched_at: None,
            last_launched_at: None,
            launched_wall: None,
            last_exit: None,
            completed_ok: false,
            fault: None,
            stopped_at: None,
        }
    }
}

impl ServiceState {
    /// Record a successful launch
    pub fn launched(&mut self, pid: Option<u32>) {
        let now = Instant::now();
        self.phase = ServicePhase::Running;
        self.launches += 1;
        self.pid = pid;
        self.completed_ok = false;
        self.first_launched_at.get_or_insert(now);
        self.last_launched_at = Some(now);
        self.launched_wall = Some(Local::now());
    }

    /// Record a process exit
    pub fn exited(&mut self, exit: ProcessExit) {
        self.pid = None;
        self.last_exit = Some(exit);
        if exit.success() {
            self.completed_ok = true;
        }
    }

    /// Move to the terminal `Failed` phase
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.phase = ServicePhase::Failed;
        self.pid = None;
        self.fault = Some(reason.into());
    }

    /// Move to `Stopped` after a teardown
    pub fn stopped(&mut self) {
        self.phase = ServicePhase::Stopped;
        self.pid = None;
        self.stopped_at = Some(Instant::now());
    }

    /// Short description of why the service is no longer running
    pub fn end_reason(&self) -> String {
        if let Some(fault) = &self.fault {
            return fault.clone();
        }
        match (self.phase, self.last_exit) {
            (ServicePhase::Stopped, _) => "stopped".to_string(),
            (_, Some(exit)) => format!("exited with {}", exit),
            _ => self.phase.to_string(),
        }
    }
}
