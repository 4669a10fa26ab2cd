//! Dependency gating
//!
//! A service registers its dependency edges with the [`DependencyGate`] and
//! gets back a [`ReleaseToken`]. The token resolves once every edge is
//! satisfied, or with a [`GateFault`] when one of them never can be. All
//! waiting is driven by `watch` channel notifications.

use crate::config::DependencyCondition;
use crate::runtime::health::HealthSnapshot;
use crate::runtime::spec::{DependencyEdge, ServiceSpec};
use crate::runtime::state::{ServicePhase, ServiceState};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What a dependent does when one of its dependencies fails for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatePolicy {
    /// Fail the dependent with `DependencyTerminal`
    #[default]
    Abort,
    /// Keep waiting (bounded only by the startup timeout)
    Wait,
}

impl FromStr for GatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "abort" => Ok(GatePolicy::Abort),
            "wait" => Ok(GatePolicy::Wait),
            _ => Err(format!(
                "Invalid dependency policy '{}'. Valid values: abort, wait",
                s
            )),
        }
    }
}

impl std::fmt::Display for GatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatePolicy::Abort => write!(f, "abort"),
            GatePolicy::Wait => write!(f, "wait"),
        }
    }
}

/// Why a dependent was not released
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateFault {
    #[error(
        "Service '{dependent}' timed out after {timeout:?} waiting on: {}",
        .waiting_on.join(", ")
    )]
    DependencyTimeout {
        dependent: String,
        waiting_on: Vec<String>,
        timeout: Duration,
    },

    #[error("Service '{dependent}' cannot start: dependency '{dependency}' failed ({reason})")]
    DependencyTerminal {
        dependent: String,
        dependency: String,
        reason: String,
    },

    #[error("Service '{dependent}' cannot start: dependency '{dependency}' is unavailable")]
    DependencyUnavailable {
        dependent: String,
        dependency: String,
    },

    #[error("Registration of service '{dependent}' was cancelled")]
    Cancelled { dependent: String },
}

impl GateFault {
    /// The service that was not released
    pub fn dependent(&self) -> &str {
        match self {
            GateFault::DependencyTimeout { dependent, .. }
            | GateFault::DependencyTerminal { dependent, .. }
            | GateFault::DependencyUnavailable { dependent, .. }
            | GateFault::Cancelled { dependent } => dependent,
        }
    }
}

type Release = Option<Result<(), GateFault>>;

/// Handle that resolves once a dependent may launch
#[derive(Debug, Clone)]
pub struct ReleaseToken {
    dependent: String,
    rx: watch::Receiver<Release>,
}

impl ReleaseToken {
    fn new(dependent: &str) -> (watch::Sender<Release>, Self) {
        let (tx, rx) = watch::channel(None);
        (
            tx,
            Self {
                dependent: dependent.to_string(),
                rx,
            },
        )
    }

    /// Name of the dependent this token releases
    pub fn dependent(&self) -> &str {
        &self.dependent
    }

    /// Outcome, if already decided
    pub fn try_result(&self) -> Option<Result<(), GateFault>> {
        self.rx.borrow().clone()
    }

    /// Wait for the release decision
    pub async fn wait(&self) -> Result<(), GateFault> {
        let mut rx = self.rx.clone();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(release) => release.clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(|| {
            Err(GateFault::Cancelled {
                dependent: self.dependent.clone(),
            })
        })
    }
}

/// Observation side of one service, as seen by the gate
#[derive(Debug, Clone)]
pub struct ServiceWatch {
    pub lifecycle: watch::Receiver<ServiceState>,
    pub health: watch::Receiver<HealthSnapshot>,
}

#[derive(Debug, PartialEq, Eq)]
enum EdgeStatus {
    Satisfied,
    Pending,
    Fault(GateFault),
}

/// Decide an edge from the current state of its dependency
fn evaluate(
    edge: &DependencyEdge,
    state: &ServiceState,
    health: &HealthSnapshot,
    policy: GatePolicy,
) -> EdgeStatus {
    let satisfied = match edge.condition {
        DependencyCondition::ServiceStarted => state.first_launched_at.is_some(),
        DependencyCondition::ServiceHealthy => health.ever_healthy(),
        DependencyCondition::ServiceCompletedSuccessfully => state.completed_ok,
    };
    if satisfied {
        return EdgeStatus::Satisfied;
    }

    match state.phase {
        ServicePhase::Stopped => EdgeStatus::Fault(GateFault::DependencyUnavailable {
            dependent: edge.dependent.clone(),
            dependency: edge.dependency.clone(),
        }),
        ServicePhase::Exited | ServicePhase::Failed if policy == GatePolicy::Abort => {
            EdgeStatus::Fault(GateFault::DependencyTerminal {
                dependent: edge.dependent.clone(),
                dependency: edge.dependency.clone(),
                reason: state.end_reason(),
            })
        }
        _ => EdgeStatus::Pending,
    }
}

fn unavailable(edge: &DependencyEdge) -> GateFault {
    GateFault::DependencyUnavailable {
        dependent: edge.dependent.clone(),
        dependency: edge.dependency.clone(),
    }
}

/// Wait until one edge is satisfied or can no longer be
async fn wait_edge(
    edge: DependencyEdge,
    mut watch: ServiceWatch,
    policy: GatePolicy,
) -> Result<(), GateFault> {
    let mut lifecycle_open = true;
    let mut health_open = true;
    loop {
        let (status, phase) = {
            let state = watch.lifecycle.borrow_and_update();
            let health = watch.health.borrow_and_update();
            (evaluate(&edge, &state, &health, policy), state.phase)
        };

        match status {
            EdgeStatus::Satisfied => {
                log::debug!(
                    "[{}] Dependency '{}' satisfied ({})",
                    edge.dependent,
                    edge.dependency,
                    edge.condition
                );
                return Ok(());
            }
            EdgeStatus::Fault(fault) => return Err(fault),
            EdgeStatus::Pending if !lifecycle_open => {
                // The dependency's runner is gone; its last state is final
                if matches!(phase, ServicePhase::Exited | ServicePhase::Failed) {
                    // Only the startup timeout ends this wait
                    std::future::pending::<()>().await;
                }
                return Err(unavailable(&edge));
            }
            EdgeStatus::Pending => {}
        }

        tokio::select! {
            changed = watch.lifecycle.changed() => {
                if changed.is_err() {
                    lifecycle_open = false;
                }
            }
            changed = watch.health.changed(), if health_open => {
                if changed.is_err() {
                    health_open = false;
                }
            }
        }
    }
}

struct Registration {
    edges: Vec<DependencyEdge>,
    token: ReleaseToken,
    task: Option<JoinHandle<()>>,
}

impl Registration {
    fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Releases dependents once their dependency edges are satisfied
pub struct DependencyGate {
    policy: GatePolicy,
    startup_timeout: Option<Duration>,
    services: HashMap<String, ServiceWatch>,
    registrations: Mutex<HashMap<String, Registration>>,
}

impl DependencyGate {
    pub fn new(policy: GatePolicy, startup_timeout: Option<Duration>) -> Self {
        Self {
            policy,
            startup_timeout,
            services: HashMap::new(),
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Make a service observable as a dependency
    pub fn observe(&mut self, name: impl Into<String>, watch: ServiceWatch) {
        self.services.insert(name.into(), watch);
    }

    pub fn policy(&self) -> GatePolicy {
        self.policy
    }

    fn registrations(&self) -> MutexGuard<'_, HashMap<String, Registration>> {
        self.registrations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a dependent and get its release token
    ///
    /// Registering the same dependent again with the same edges returns the
    /// existing token. A different edge set replaces the old registration,
    /// whose token resolves to `Cancelled`.
    pub fn register(&self, dependent: &ServiceSpec, edges: &[DependencyEdge]) -> ReleaseToken {
        let mut registrations = self.registrations();

        if let Some(existing) = registrations.get(&dependent.name) {
            if existing.edges == edges {
                log::debug!("[{}] Already registered with the gate", dependent.name);
                return existing.token.clone();
            }
        }
        if let Some(old) = registrations.remove(&dependent.name) {
            old.abort();
        }

        let (tx, token) = ReleaseToken::new(&dependent.name);

        // Edges to services the gate cannot observe fail right away
        let mut waits = Vec::with_capacity(edges.len());
        let mut missing = None;
        for edge in edges {
            match self.services.get(&edge.dependency) {
                Some(watch) => waits.push((edge.clone(), watch.clone())),
                None => {
                    missing = Some(unavailable(edge));
                    break;
                }
            }
        }

        let task = match missing {
            Some(fault) => {
                log::error!("{}", fault);
                let _ = tx.send(Some(Err(fault)));
                None
            }
            None => Some(tokio::spawn(release_when_ready(
                dependent.name.clone(),
                waits,
                self.policy,
                self.startup_timeout,
                tx,
            ))),
        };

        if !edges.is_empty() {
            log::info!(
                "[{}] Waiting on {}",
                dependent.name,
                describe_edges(edges)
            );
        }

        registrations.insert(
            dependent.name.clone(),
            Registration {
                edges: edges.to_vec(),
                token: token.clone(),
                task,
            },
        );
        token
    }

    /// Drop a dependent's registration; its pending token resolves to `Cancelled`
    pub fn unregister(&self, dependent: &str) {
        if let Some(registration) = self.registrations().remove(dependent) {
            registration.abort();
        }
    }

    /// Dependencies a registered dependent is still waiting on
    pub fn pending_dependencies(&self, dependent: &str) -> Vec<String> {
        let registrations = self.registrations();
        let Some(registration) = registrations.get(dependent) else {
            return Vec::new();
        };
        registration
            .edges
            .iter()
            .filter(|edge| {
                self.services.get(&edge.dependency).map_or(true, |watch| {
                    let state = watch.lifecycle.borrow();
                    let health = watch.health.borrow();
                    evaluate(edge, &state, &health, self.policy) != EdgeStatus::Satisfied
                })
            })
            .map(|edge| edge.dependency.clone())
            .collect()
    }
}

impl Drop for DependencyGate {
    fn drop(&mut self) {
        for (_, registration) in self.registrations().drain() {
            registration.abort();
        }
    }
}

fn describe_edges(edges: &[DependencyEdge]) -> String {
    edges
        .iter()
        .map(|e| format!("{} ({})", e.dependency, e.condition))
        .collect::<Vec<_>>()
        .join(", ")
}

async fn release_when_ready(
    dependent: String,
    waits: Vec<(DependencyEdge, ServiceWatch)>,
    policy: GatePolicy,
    startup_timeout: Option<Duration>,
    tx: watch::Sender<Release>,
) {
    let observed = waits.clone();
    let all = futures::future::try_join_all(
        waits
            .into_iter()
            .map(|(edge, watch)| wait_edge(edge, watch, policy)),
    );

    let result = match startup_timeout {
        Some(limit) => match tokio::time::timeout(limit, all).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                let waiting_on = observed
                    .iter()
                    .filter(|(edge, watch)| {
                        let state = watch.lifecycle.borrow();
                        let health = watch.health.borrow();
                        evaluate(edge, &state, &health, policy) != EdgeStatus::Satisfied
                    })
                    .map(|(edge, _)| edge.dependency.clone())
                    .collect();
                Err(GateFault::DependencyTimeout {
                    dependent: dependent.clone(),
                    waiting_on,
                    timeout: limit,
                })
            }
        },
        None => all.await.map(|_| ()),
    };

    match &result {
        Ok(()) => log::debug!("[{}] Released", dependent),
        Err(fault) => log::error!("{}", fault),
    }
    let _ = tx.send(Some(result));
}
