//! Managed process abstraction

use indexmap::IndexMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Process status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Process is pending start
    Pending,
    /// Process is running
    Running,
    /// Process has stopped with exit code
    Stopped(Option<i32>),
    /// Process failed to start
    Failed,
}

impl ProcessStatus {
    /// Check if process is running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running)
    }

    /// Check if process has stopped
    pub fn is_stopped(&self) -> bool {
        matches!(self, ProcessStatus::Stopped(_) | ProcessStatus::Failed)
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Configuration for spawning a process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Process name (for logging)
    pub name: String,
    /// Executable path
    pub executable: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Environment variables, on top of the supervisor's own
    pub env: IndexMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
}

/// Event emitted by a managed process
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// Process started
    Started { pid: u32 },
    /// Process output line (stdout or stderr)
    Output { line: String, is_stderr: bool },
    /// Process exited
    Exited { exit: ProcessExit },
    /// Process failed to start
    Failed { error: String },
}

/// A managed child process
pub struct ManagedProcess {
    /// Process configuration
    pub config: ProcessConfig,
    /// Current status
    pub status: ProcessStatus,
    /// Process ID (if running)
    pub pid: Option<u32>,
    /// Start time
    pub started_at: Option<Instant>,
    /// Child process handle
    child: Option<Child>,
    /// Event sender
    event_tx: Option<mpsc::UnboundedSender<(String, ProcessEvent)>>,
}

impl ManagedProcess {
    /// Create a new managed process
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            status: ProcessStatus::Pending,
            pid: None,
            started_at: None,
            child: None,
            event_tx: None,
        }
    }

    /// Set the event sender for this process
    pub fn with_event_sender(mut self, tx: mpsc::UnboundedSender<(String, ProcessEvent)>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn emit(&self, event: ProcessEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send((self.config.name.clone(), event));
        }
    }

    /// Start the process
    pub async fn start(&mut self) -> Result<(), ProcessError> {
        if self.status.is_running() {
            return Err(ProcessError::AlreadyRunning(self.config.name.clone()));
        }

        log::info!(
            "[{}] Starting: {} {}",
            self.config.name,
            self.config.executable,
            self.config.args.join(" ")
        );

        let mut cmd = Command::new(&self.config.executable);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        match cmd.spawn() {
            Ok(mut child) => {
                let pid = child.id().unwrap_or(0);
                self.pid = Some(pid);
                self.status = ProcessStatus::Running;
                self.started_at = Some(Instant::now());

                self.emit(ProcessEvent::Started { pid });

                // Spawn output readers
                if let Some(tx) = self.event_tx.clone() {
                    if let Some(stdout) = child.stdout.take() {
                        spawn_line_reader(self.config.name.clone(), stdout, false, tx.clone());
                    }
                    if let Some(stderr) = child.stderr.take() {
                        spawn_line_reader(self.config.name.clone(), stderr, true, tx);
                    }
                }

                self.child = Some(child);
                Ok(())
            }
            Err(e) => {
                self.status = ProcessStatus::Failed;
                self.emit(ProcessEvent::Failed {
                    error: format!("Failed to spawn process: {}", e),
                });

                Err(ProcessError::SpawnFailed {
                    name: self.config.name.clone(),
                    source: e,
                })
            }
        }
    }

    /// Wait for the process to exit
    ///
    /// Cancel safe: dropping the future leaves the process running.
    pub async fn wait(&mut self) -> Result<ProcessExit, ProcessError> {
        let Some(child) = self.child.as_mut() else {
            return Err(ProcessError::NotRunning(self.config.name.clone()));
        };

        let status = child.wait().await.map_err(|e| ProcessError::Wait {
            name: self.config.name.clone(),
            source: e,
        })?;

        let exit = ProcessExit::from_status(status);
        self.child = None;
        self.pid = None;
        self.status = ProcessStatus::Stopped(exit.code);
        self.emit(ProcessEvent::Exited { exit });
        Ok(exit)
    }

    /// Stop the process gracefully (SIGTERM, then SIGKILL after timeout)
    pub async fn stop(&mut self, timeout: Duration) -> Result<Option<ProcessExit>, ProcessError> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };

        log::info!("[{}] Stopping process...", self.config.name);

        // Try graceful shutdown first (SIGTERM on Unix)
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    log::debug!("[{}] SIGTERM failed: {}", self.config.name, e);
                }
            }
        }

        #[cfg(not(unix))]
        {
            // On non-Unix, just kill immediately
            let _ = child.start_kill();
        }

        // Wait for process to exit with timeout
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "[{}] Process did not exit gracefully, forcing kill",
                    self.config.name
                );
                // kill() sends SIGKILL and reaps the child
                child.kill().await.map_err(|e| ProcessError::Wait {
                    name: self.config.name.clone(),
                    source: e,
                })?;
                child.wait().await
            }
        };

        self.pid = None;
        let exit = match status {
            Ok(status) => ProcessExit::from_status(status),
            Err(e) => {
                self.status = ProcessStatus::Stopped(None);
                return Err(ProcessError::Wait {
                    name: self.config.name.clone(),
                    source: e,
                });
            }
        };

        self.status = ProcessStatus::Stopped(exit.code);
        self.emit(ProcessEvent::Exited { exit });
        Ok(Some(exit))
    }

    /// Get uptime duration
    pub fn uptime(&self) -> Option<Duration> {
        match self.status {
            ProcessStatus::Running => self.started_at.map(|t| t.elapsed()),
            _ => None,
        }
    }
}

fn spawn_line_reader<R>(
    name: String,
    stream: R,
    is_stderr: bool,
    tx: mpsc::UnboundedSender<(String, ProcessEvent)>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx
                .send((name.clone(), ProcessEvent::Output { line, is_stderr }))
                .is_err()
            {
                break;
            }
        }
    });
}

/// Errors that can occur with managed processes
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Process '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Failed to spawn process '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{0}' is not running")]
    NotRunning(String),

    #[error("Failed to wait for process '{name}': {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
