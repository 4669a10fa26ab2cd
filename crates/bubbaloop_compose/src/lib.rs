//! Bubbaloop Compose
//!
//! A compose-style supervisor that starts interdependent services in
//! dependency order, holding each one back until the services it depends
//! on are verified ready by their healthchecks.
//!
//! # Overview
//!
//! - Services and their dependencies are declared in a compose YAML file
//! - Dependency cycles and unknown references are rejected before anything starts
//! - `service_healthy` dependents launch only after the dependency's
//!   healthcheck has passed
//! - Restart policies (`no`, `always`, `on-failure`, `unless-stopped`)
//!   with exponential backoff and an optional restart budget
//! - Shutdown stops dependents before their dependencies
//!
//! # Example Compose File
//!
//! ```yaml
//! services:
//!   db:
//!     command: ["postgres", "-D", "/var/lib/postgresql/data"]
//!     environment:
//!       POSTGRES_DB: ${DB_NAME:-app}
//!     healthcheck:
//!       test: ["CMD-SHELL", "pg_isready -U app"]
//!       interval: 10s
//!       timeout: 5s
//!       retries: 5
//!       start_period: 10s
//!
//!   web:
//!     command: python manage.py runserver 0.0.0.0:8000
//!     env_file: [.env]
//!     depends_on:
//!       db:
//!         condition: service_healthy
//!     restart: on-failure
//!     ports: ["8000:8000"]
//! ```

pub mod cli;
pub mod config;
pub mod runtime;

pub use cli::ComposeArgs;
pub use config::{
    ComposeFile, ComposeFileError, DependencyCondition, EnvFileError, InterpolationError,
    Interpolator, RestartPolicy,
};
pub use runtime::{
    CommandProbe, DependencyEdge, DependencyGate, GateFault, GatePolicy, GraphError,
    HealthEvent, HealthMonitor, HealthSnapshot, HealthStatus, LaunchPlan, ManagedProcess,
    ProbeCommand, ProbeResult, ProbeRunner, ProbeSpec, ProcessConfig, ProcessError,
    ProcessEvent, ProcessExit, ProcessStatus, ReleaseToken, ServiceGraph, ServicePhase,
    ServiceSpec, ServiceState, ServiceStatus, ServiceSupervisor, StatusReport,
    SupervisorConfig, SupervisorError, SupervisorHandle,
};
