//! Service supervisor - orchestrates gated startup, restarts and shutdown

use crate::config::{ComposeFile, ComposeFileError};
use crate::runtime::gate::{DependencyGate, GatePolicy, ServiceWatch};
use crate::runtime::graph::{GraphError, ServiceGraph};
use crate::runtime::health::{
    health_channel, HealthEvent, HealthFeed, HealthMonitor, HealthPublisher, HealthSnapshot,
    HealthStatus,
};
use crate::runtime::probe::{CommandProbe, ProbeRunner};
use crate::runtime::process::{ManagedProcess, ProcessEvent};
use crate::runtime::spec::ServiceSpec;
use crate::runtime::state::{ServicePhase, ServiceState};
use indexmap::IndexMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Upper bound for the exponential restart backoff
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Project directory; relative paths in the compose file resolve here
    pub project_dir: PathBuf,
    /// Longest a dependent may wait on its dependencies (None = forever)
    pub startup_timeout: Option<Duration>,
    /// What dependents do when a dependency fails for good
    pub dependency_policy: GatePolicy,
    /// Cap for the restart backoff
    pub max_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            project_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            startup_timeout: None,
            dependency_policy: GatePolicy::Abort,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// Starts a service graph
pub struct ServiceSupervisor {
    config: SupervisorConfig,
    probe_runner: Arc<dyn ProbeRunner>,
}

impl ServiceSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            probe_runner: Arc::new(CommandProbe),
        }
    }

    /// Use a different probe runner for every service
    pub fn with_probe_runner(mut self, runner: Arc<dyn ProbeRunner>) -> Self {
        self.probe_runner = runner;
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Build the graph of a compose file and start it
    ///
    /// An empty `selected` list starts every service; otherwise the
    /// selected services and their transitive dependencies. A malformed
    /// graph is rejected before anything is launched.
    pub fn up(
        &self,
        compose: &ComposeFile,
        selected: &[String],
    ) -> Result<SupervisorHandle, SupervisorError> {
        let graph = ServiceGraph::build(compose, &self.config.project_dir, selected)?;
        Ok(self.start(graph))
    }

    /// Start every service of the graph
    ///
    /// Services without dependencies launch right away and concurrently;
    /// the others wait on their release token. Must be called from within a
    /// tokio runtime.
    pub fn start(&self, graph: ServiceGraph) -> SupervisorHandle {
        log::info!("Starting {} services...", graph.len());

        let graph = Arc::new(graph);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut gate = DependencyGate::new(self.config.dependency_policy, self.config.startup_timeout);

        // Channels first, so the gate can observe every service before any
        // of them registers
        let mut pending = Vec::with_capacity(graph.len());
        let mut services = IndexMap::with_capacity(graph.len());
        for spec in graph.launch_order() {
            let (state_tx, state_rx) = watch::channel(ServiceState::default());
            let (publisher, feed) = health_channel(&spec.name);
            let (stop_tx, stop_rx) = watch::channel(false);

            gate.observe(
                spec.name.clone(),
                ServiceWatch {
                    lifecycle: state_rx.clone(),
                    health: feed.watch(),
                },
            );

            pending.push((Arc::clone(spec), state_tx, publisher, stop_rx));
            services.insert(
                spec.name.clone(),
                ServiceSlot {
                    spec: Arc::clone(spec),
                    state: state_rx,
                    health: feed,
                    stop_tx,
                    task: Mutex::new(None),
                },
            );
        }

        let gate = Arc::new(gate);
        for (spec, state, publisher, stop_rx) in pending {
            let runner = ServiceRunner {
                spec: Arc::clone(&spec),
                gate: Arc::clone(&gate),
                probe_runner: Arc::clone(&self.probe_runner),
                state,
                publisher: Some(publisher),
                events: event_tx.clone(),
                stop_rx,
                max_backoff: self.config.max_backoff,
            };
            let task = tokio::spawn(runner.run());
            if let Some(slot) = services.get(&spec.name) {
                *lock(&slot.task) = Some(task);
            }
        }
        drop(event_tx);

        tokio::spawn(pump_events(event_rx));

        SupervisorHandle {
            graph,
            gate,
            services,
            started_at: Instant::now(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Forward process output and lifecycle events to the log
async fn pump_events(mut event_rx: mpsc::UnboundedReceiver<(String, ProcessEvent)>) {
    while let Some((name, event)) = event_rx.recv().await {
        match event {
            ProcessEvent::Output { line, is_stderr } => {
                if is_stderr {
                    log::warn!("[{}] {}", name, line);
                } else {
                    log::info!("[{}] {}", name, line);
                }
            }
            ProcessEvent::Exited { exit } => {
                log::info!("[{}] Process exited with {}", name, exit);
            }
            ProcessEvent::Failed { error } => {
                log::error!("[{}] Process failed: {}", name, error);
            }
            ProcessEvent::Started { pid } => {
                log::info!("[{}] Process started with PID: {}", name, pid);
            }
        }
    }
}

/// Resolves once a stop has been requested or the handle is gone
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

/// Supervision task of one service; the only writer of its lifecycle state
struct ServiceRunner {
    spec: Arc<ServiceSpec>,
    gate: Arc<DependencyGate>,
    probe_runner: Arc<dyn ProbeRunner>,
    state: watch::Sender<ServiceState>,
    publisher: Option<HealthPublisher>,
    events: mpsc::UnboundedSender<(String, ProcessEvent)>,
    stop_rx: watch::Receiver<bool>,
    max_backoff: Duration,
}

impl ServiceRunner {
    async fn run(mut self) {
        if self.wait_for_release().await {
            self.supervise().await;
        }

        // The health stream is not restartable once the service is done
        if let Some(publisher) = self.publisher.take() {
            publisher.close();
        }
    }

    /// Wait on the gate; false when the service must not launch
    async fn wait_for_release(&mut self) -> bool {
        let name = self.spec.name.clone();
        if self.spec.dependencies.is_empty() {
            return true;
        }

        self.state.send_modify(|s| s.phase = ServicePhase::Blocked);
        let token = self.gate.register(&self.spec, &self.spec.dependencies);

        let result = tokio::select! {
            biased;
            _ = stop_requested(&mut self.stop_rx) => {
                log::info!("[{}] Stopped while waiting on dependencies", name);
                self.gate.unregister(&name);
                self.state.send_modify(ServiceState::stopped);
                return false;
            }
            result = token.wait() => result,
        };

        match result {
            Ok(()) => true,
            Err(fault) => {
                self.state.send_modify(|s| s.fail(fault.to_string()));
                false
            }
        }
    }

    /// Launch, watch and restart the process until it settles or is stopped
    async fn supervise(&mut self) {
        let name = self.spec.name.clone();
        let mut restarts: u32 = 0;

        loop {
            let mut process = ManagedProcess::new(self.spec.process_config())
                .with_event_sender(self.events.clone());

            if let Err(e) = process.start().await {
                self.state.send_modify(|s| s.fail(e.to_string()));
                return;
            }

            let launched_at = Instant::now();
            self.state.send_modify(|s| s.launched(process.pid));

            let monitor = match (&self.spec.probe, self.publisher.take()) {
                (Some(probe), Some(publisher)) => Some(
                    HealthMonitor::new(probe.clone(), Arc::clone(&self.probe_runner), publisher)
                        .spawn(launched_at),
                ),
                (_, publisher) => {
                    self.publisher = publisher;
                    None
                }
            };

            let outcome = tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop_rx) => None,
                exit = process.wait() => Some(exit),
            };

            // Stop probing before anything else happens to the process
            if let Some(monitor) = monitor {
                self.publisher = monitor.stop().await;
            }

            let exit = match outcome {
                None => {
                    match process.stop(self.spec.stop_timeout).await {
                        Ok(Some(exit)) => self.state.send_modify(|s| s.exited(exit)),
                        Ok(None) => {}
                        Err(e) => log::error!("[{}] Error stopping process: {}", name, e),
                    }
                    self.state.send_modify(ServiceState::stopped);
                    return;
                }
                Some(Err(e)) => {
                    self.state.send_modify(|s| s.fail(e.to_string()));
                    return;
                }
                Some(Ok(exit)) => exit,
            };

            self.state.send_modify(|s| s.exited(exit));

            if !self.spec.restart.should_restart(exit.code) {
                if exit.success() {
                    log::info!("[{}] Completed", name);
                    self.state.send_modify(|s| s.phase = ServicePhase::Exited);
                } else {
                    let reason = format!(
                        "exited with {} (restart policy: {})",
                        exit, self.spec.restart
                    );
                    log::error!("[{}] Service failed: {}", name, reason);
                    self.state.send_modify(|s| s.fail(reason));
                }
                return;
            }

            if let Some(max) = self.spec.max_restarts {
                if restarts >= max {
                    let reason = format!(
                        "restart budget of {} exhausted (last {})",
                        max, exit
                    );
                    log::error!("[{}] Service failed: {}", name, reason);
                    self.state.send_modify(|s| s.fail(reason));
                    return;
                }
            }

            let backoff = self
                .spec
                .restart_backoff
                .saturating_mul(1 << restarts.min(16))
                .min(self.max_backoff);
            restarts += 1;
            log::warn!(
                "[{}] Exited with {}, restarting in {:?} (restart {})",
                name,
                exit,
                backoff,
                restarts
            );
            self.state.send_modify(|s| {
                s.phase = ServicePhase::Restarting;
                s.restarts = restarts;
            });

            tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop_rx) => {
                    self.state.send_modify(ServiceState::stopped);
                    return;
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

/// Handle-side view of one supervised service
struct ServiceSlot {
    spec: Arc<ServiceSpec>,
    state: watch::Receiver<ServiceState>,
    health: HealthFeed,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceSlot {
    /// Request teardown and wait for the supervision task to finish
    async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("[{}] Supervision task failed: {}", self.spec.name, e);
            }
        }
    }
}

/// Handle to a running service graph
///
/// Dropping the handle tears every service down.
pub struct SupervisorHandle {
    graph: Arc<ServiceGraph>,
    gate: Arc<DependencyGate>,
    services: IndexMap<String, ServiceSlot>,
    started_at: Instant,
}

impl SupervisorHandle {
    fn slot(&self, name: &str) -> Result<&ServiceSlot, SupervisorError> {
        self.services
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))
    }

    /// The supervised graph
    pub fn graph(&self) -> &ServiceGraph {
        &self.graph
    }

    /// Service names in launch order
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Current lifecycle state of a service
    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.services.get(name).map(|slot| slot.state.borrow().clone())
    }

    /// Receiver that wakes on every lifecycle change of a service
    pub fn watch_service(&self, name: &str) -> Option<watch::Receiver<ServiceState>> {
        self.services.get(name).map(|slot| slot.state.clone())
    }

    /// Current health snapshot of a service
    pub fn health(&self, name: &str) -> Option<HealthSnapshot> {
        self.services.get(name).map(|slot| slot.health.snapshot())
    }

    /// Stream of health transitions of a service
    pub fn subscribe_health(&self, name: &str) -> Option<mpsc::UnboundedReceiver<HealthEvent>> {
        self.services.get(name).map(|slot| slot.health.subscribe())
    }

    /// Whether any service ended in a terminal failure
    pub fn any_failed(&self) -> bool {
        self.services
            .values()
            .any(|slot| slot.state.borrow().phase == ServicePhase::Failed)
    }

    /// Tear down one service
    ///
    /// Dependents still waiting on it get a `DependencyUnavailable` fault.
    pub async fn stop_service(&self, name: &str) -> Result<(), SupervisorError> {
        let slot = self.slot(name)?;
        log::info!("[{}] Stopping service...", name);
        slot.stop().await;
        Ok(())
    }

    /// Wait until every service has settled or the shutdown signal fires
    pub async fn wait(&self, mut shutdown_rx: watch::Receiver<()>) {
        let settled = futures::future::join_all(self.services.values().map(|slot| {
            let mut state = slot.state.clone();
            async move {
                let _ = state.wait_for(|s| s.phase.is_settled()).await;
            }
        }));

        tokio::select! {
            _ = shutdown_rx.changed() => {
                log::info!("Shutdown signal received");
            }
            _ = settled => {
                log::info!("All services have settled");
            }
        }
    }

    /// Stop every service, dependents strictly before their dependencies
    ///
    /// Returns the names in the order they were stopped.
    pub async fn shutdown(&self) -> Vec<String> {
        log::info!("Shutting down all services...");

        let mut order = Vec::with_capacity(self.services.len());
        for spec in self.graph.shutdown_order() {
            if let Some(slot) = self.services.get(&spec.name) {
                slot.stop().await;
                order.push(spec.name.clone());
            }
        }

        log::info!("All services shut down");
        order
    }

    /// Per-service status report
    pub fn status(&self) -> StatusReport {
        let services = self
            .services
            .values()
            .map(|slot| {
                let state = slot.state.borrow().clone();
                let health = slot.spec.probe.as_ref().map(|_| slot.health.snapshot());
                let blocked_on = if state.phase == ServicePhase::Blocked {
                    self.gate.pending_dependencies(&slot.spec.name)
                } else {
                    Vec::new()
                };

                ServiceStatus {
                    name: slot.spec.name.clone(),
                    state: state.phase,
                    health: health.as_ref().map(HealthSnapshot::status),
                    pid: state.pid,
                    launches: state.launches,
                    restarts: state.restarts,
                    exit_code: state.last_exit.and_then(|e| e.code),
                    signal: state.last_exit.and_then(|e| e.signal),
                    blocked_on,
                    fault: state.fault.clone(),
                    started_at: state.launched_wall.map(|t| t.to_rfc3339()),
                    uptime_secs: match state.phase {
                        ServicePhase::Running => state.last_launched_at.map(|t| t.elapsed().as_secs()),
                        _ => None,
                    },
                    last_probe: health
                        .and_then(|h| h.last_result)
                        .map(|r| r.output.trim().to_string())
                        .filter(|output| !output.is_empty()),
                }
            })
            .collect();

        StatusReport {
            uptime_secs: self.started_at.elapsed().as_secs(),
            services,
        }
    }
}

/// Status of one service, as shown to the user
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServicePhase,
    /// None when the service has no healthcheck
    pub health: Option<HealthStatus>,
    pub pid: Option<u32>,
    pub launches: u32,
    pub restarts: u32,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Dependencies a blocked service is still waiting on
    pub blocked_on: Vec<String>,
    pub fault: Option<String>,
    /// RFC 3339 time of the latest launch
    pub started_at: Option<String>,
    pub uptime_secs: Option<u64>,
    pub last_probe: Option<String>,
}

impl ServiceStatus {
    /// One-line description
    pub fn summary(&self) -> String {
        match self.state {
            ServicePhase::Blocked if !self.blocked_on.is_empty() => {
                format!("blocked on {}", self.blocked_on.join(", "))
            }
            ServicePhase::Running => match self.health {
                Some(HealthStatus::Starting) => "starting".to_string(),
                Some(health) => format!("running ({})", health),
                None => "running".to_string(),
            },
            ServicePhase::Failed => match &self.fault {
                Some(fault) => format!("failed: {}", fault),
                None => "failed".to_string(),
            },
            ServicePhase::Exited | ServicePhase::Restarting => match self.exit_code {
                Some(code) => format!("{} (exit code {})", self.state, code),
                None => self.state.to_string(),
            },
            _ => self.state.to_string(),
        }
    }
}

/// Per-service status report
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub uptime_secs: u64,
    pub services: Vec<ServiceStatus>,
}

impl StatusReport {
    pub fn get(&self, name: &str) -> Option<&ServiceStatus> {
        self.services.iter().find(|s| s.name == name)
    }
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let width = self
            .services
            .iter()
            .map(|s| s.name.len())
            .max()
            .unwrap_or(0)
            .max("SERVICE".len());

        writeln!(
            f,
            "{:<width$}  {:<10}  {:<9}  {:>7}  {:>8}  STATUS",
            "SERVICE", "STATE", "HEALTH", "PID", "RESTARTS"
        )?;
        for service in &self.services {
            writeln!(
                f,
                "{:<width$}  {:<10}  {:<9}  {:>7}  {:>8}  {}",
                service.name,
                service.state.to_string(),
                service
                    .health
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                service
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                service.restarts,
                service.summary(),
            )?;
        }
        Ok(())
    }
}

/// Errors that can occur in the supervisor
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("No such service: '{0}'")]
    UnknownService(String),

    #[error("Dependency error: {0}")]
    Graph(#[from] GraphError),

    #[error("Compose file error: {0}")]
    ComposeFile(#[from] ComposeFileError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(name: &str, state: ServicePhase) -> ServiceStatus {
        ServiceStatus {
            name: name.to_string(),
            state,
            health: None,
            pid: None,
            launches: 0,
            restarts: 0,
            exit_code: None,
            signal: None,
            blocked_on: Vec::new(),
            fault: None,
            started_at: None,
            uptime_secs: None,
            last_probe: None,
        }
    }

    #[test]
    fn test_status_summaries() {
        let mut blocked = status("web", ServicePhase::Blocked);
        blocked.blocked_on = vec!["db".to_string()];
        assert_eq!(blocked.summary(), "blocked on db");

        let mut starting = status("db", ServicePhase::Running);
        starting.health = Some(HealthStatus::Starting);
        assert_eq!(starting.summary(), "starting");
        starting.health = Some(HealthStatus::Healthy);
        assert_eq!(starting.summary(), "running (healthy)");

        let mut failed = status("worker", ServicePhase::Failed);
        failed.fault = Some("restart budget of 2 exhausted".to_string());
        assert_eq!(failed.summary(), "failed: restart budget of 2 exhausted");

        let mut exited = status("migrate", ServicePhase::Exited);
        exited.exit_code = Some(0);
        assert_eq!(exited.summary(), "exited (exit code 0)");
    }

    #[test]
    fn test_status_report_table_and_json() {
        let mut db = status("db", ServicePhase::Running);
        db.health = Some(HealthStatus::Healthy);
        db.pid = Some(4242);
        let mut web = status("web", ServicePhase::Blocked);
        web.blocked_on = vec!["db".to_string()];

        let report = StatusReport {
            uptime_secs: 3,
            services: vec![db, web],
        };

        let table = report.to_string();
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].starts_with("SERVICE"));
        assert!(lines[1].contains("4242"));
        assert!(lines[1].contains("healthy"));
        assert!(lines[2].ends_with("blocked on db"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["services"][0]["state"], "running");
        assert_eq!(json["services"][0]["health"], "healthy");
        assert_eq!(json["services"][1]["blocked_on"][0], "db");
        assert!(report.get("web").is_some());
    }

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.startup_timeout, None);
        assert_eq!(config.dependency_policy, GatePolicy::Abort);
        assert_eq!(config.max_backoff, DEFAULT_MAX_BACKOFF);
    }
}
