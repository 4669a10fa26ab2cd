//! Supervisor Scenario Tests
//!
//! Runs small compose graphs of real `sh` processes with millisecond probe
//! intervals and checks startup gating, fault propagation and teardown.

#![cfg(unix)]

use bubbaloop_compose::{
    ComposeFile, GatePolicy, GraphError, HealthStatus, Interpolator, ServicePhase, ServiceState,
    ServiceSupervisor, SupervisorConfig, SupervisorError, SupervisorHandle,
};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(10);

fn supervisor(dir: &TempDir) -> ServiceSupervisor {
    supervisor_with(dir, |_| {})
}

fn supervisor_with(dir: &TempDir, configure: impl FnOnce(&mut SupervisorConfig)) -> ServiceSupervisor {
    let mut config = SupervisorConfig {
        project_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    configure(&mut config);
    ServiceSupervisor::new(config)
}

fn compose(yaml: &str) -> ComposeFile {
    ComposeFile::from_yaml_with(yaml, &Interpolator::isolated()).unwrap()
}

/// Wait until a service's lifecycle state matches
async fn wait_for_state(
    handle: &SupervisorHandle,
    name: &str,
    matches: impl Fn(&ServiceState) -> bool,
) -> ServiceState {
    let mut rx = handle.watch_service(name).unwrap();
    let state = tokio::time::timeout(WAIT, rx.wait_for(|s| matches(s)))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting on '{}'", name))
        .unwrap()
        .clone();
    state
}

async fn wait_for_phase(handle: &SupervisorHandle, name: &str, phase: ServicePhase) -> ServiceState {
    wait_for_state(handle, name, |s| s.phase == phase).await
}

#[tokio::test]
async fn test_healthy_dependency_gates_launch() {
    let dir = tempfile::tempdir().unwrap();
    let file = compose(
        r#"
services:
  db:
    command: "sleep 0.5 && touch ready && exec sleep 30"
    healthcheck:
      test: ["CMD-SHELL", "test -f ready"]
      interval: 50ms
      timeout: 1s
      retries: 100
  web:
    command: "exec sleep 30"
    depends_on:
      db:
        condition: service_healthy
"#,
    );
    let handle = supervisor(&dir).up(&file, &[]).unwrap();

    // db is launched, web waits on its healthcheck
    wait_for_phase(&handle, "db", ServicePhase::Running).await;
    wait_for_phase(&handle, "web", ServicePhase::Blocked).await;
    let report = handle.status();
    let web = report.get("web").unwrap();
    assert_eq!(web.state, ServicePhase::Blocked);
    assert_eq!(web.blocked_on, vec!["db"]);
    assert_eq!(report.get("db").unwrap().health, Some(HealthStatus::Starting));

    let web = wait_for_phase(&handle, "web", ServicePhase::Running).await;
    let db_health = handle.health("db").unwrap();
    let first_healthy = db_health.first_healthy_at.unwrap();
    assert!(web.first_launched_at.unwrap() > first_healthy);
    assert_eq!(web.launches, 1);

    handle.shutdown().await;
    assert!(!handle.any_failed());
}

#[tokio::test]
async fn test_services_without_dependencies_launch_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let file = compose(
        r#"
services:
  db:
    command: "exec sleep 30"
    healthcheck:
      test: ["CMD", "false"]
      interval: 50ms
  cache:
    command: "exec sleep 30"
  web:
    command: "exec sleep 30"
    depends_on:
      db:
        condition: service_healthy
"#,
    );
    let handle = supervisor(&dir).up(&file, &[]).unwrap();

    // Neither root waits on any healthcheck
    let db = wait_for_phase(&handle, "db", ServicePhase::Running).await;
    let cache = wait_for_phase(&handle, "cache", ServicePhase::Running).await;
    assert_eq!(db.launches, 1);
    assert_eq!(cache.launches, 1);
    assert!(!handle.health("db").unwrap().ever_healthy());
    wait_for_phase(&handle, "web", ServicePhase::Blocked).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn test_startup_timeout_fails_only_the_dependent() {
    let dir = tempfile::tempdir().unwrap();
    let file = compose(
        r#"
services:
  db:
    command: "exec sleep 30"
    healthcheck:
      test: ["CMD", "false"]
      interval: 50ms
      retries: 5
  web:
    command: "exec sleep 30"
    depends_on:
      db:
        condition: service_healthy
  cache:
    command: "exec sleep 30"
"#,
    );
    let handle = supervisor_with(&dir, |c| c.startup_timeout = Some(Duration::from_millis(600)))
        .up(&file, &[])
        .unwrap();

    let web = wait_for_phase(&handle, "web", ServicePhase::Failed).await;
    assert_eq!(web.launches, 0);
    assert!(web.fault.unwrap().contains("timed out"));

    // The unrelated subtree keeps running
    assert_eq!(handle.state("db").unwrap().phase, ServicePhase::Running);
    assert_eq!(handle.state("cache").unwrap().phase, ServicePhase::Running);
    assert_eq!(handle.health("db").unwrap().status(), HealthStatus::Unhealthy);
    assert!(handle.any_failed());

    let report = handle.status();
    assert!(report.get("web").unwrap().summary().starts_with("failed:"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_cycle_is_rejected_before_anything_starts() {
    let dir = tempfile::tempdir().unwrap();
    let file = compose(
        r#"
services:
  a:
    command: "touch a-started; exec sleep 30"
    depends_on: [b]
  b:
    command: "touch b-started; exec sleep 30"
    depends_on: [a]
"#,
    );

    match supervisor(&dir).up(&file, &[]) {
        Err(SupervisorError::Graph(GraphError::CyclicDependency(names))) => {
            assert_eq!(names, vec!["a", "b"]);
        }
        Err(e) => panic!("expected a cycle error, got {}", e),
        Ok(_) => panic!("expected a cycle error"),
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!dir.path().join("a-started").exists());
    assert!(!dir.path().join("b-started").exists());
}

#[tokio::test]
async fn test_shutdown_stops_dependents_first() {
    let dir = tempfile::tempdir().unwrap();
    let file = compose(
        r#"
services:
  web:
    command: "exec sleep 30"
    depends_on: [api]
  api:
    command: "exec sleep 30"
    depends_on: [db]
  db:
    command: "exec sleep 30"
"#,
    );
    let handle = supervisor(&dir).up(&file, &[]).unwrap();
    for name in ["db", "api", "web"] {
        wait_for_phase(&handle, name, ServicePhase::Running).await;
    }

    let order = handle.shutdown().await;
    assert_eq!(order, vec!["web", "api", "db"]);

    let stopped_at = |name: &str| handle.state(name).unwrap().stopped_at.unwrap();
    assert!(stopped_at("web") < stopped_at("api"));
    assert!(stopped_at("api") < stopped_at("db"));
    for name in ["db", "api", "web"] {
        assert_eq!(handle.state(name).unwrap().phase, ServicePhase::Stopped);
    }
}

#[tokio::test]
async fn test_restart_budget_failure_cascades_to_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let file = compose(
        r#"
services:
  flaky:
    command: "exit 3"
    restart: on-failure
    max_restarts: 2
    restart_backoff: 10ms
    healthcheck:
      test: ["CMD", "true"]
      interval: 1s
  web:
    command: "exec sleep 30"
    depends_on:
      flaky:
        condition: service_healthy
  worker:
    command: "exec sleep 30"
    depends_on: [web]
  cache:
    command: "exec sleep 30"
"#,
    );
    let handle = supervisor(&dir).up(&file, &[]).unwrap();

    let flaky = wait_for_phase(&handle, "flaky", ServicePhase::Failed).await;
    assert_eq!(flaky.launches, 3);
    assert_eq!(flaky.restarts, 2);
    assert_eq!(flaky.last_exit.unwrap().code, Some(3));
    assert!(flaky.fault.unwrap().contains("restart budget"));

    // Each dependent in the subtree is reported on its own
    let web = wait_for_phase(&handle, "web", ServicePhase::Failed).await;
    assert!(web.fault.unwrap().contains("'flaky'"));
    let worker = wait_for_phase(&handle, "worker", ServicePhase::Failed).await;
    assert!(worker.fault.unwrap().contains("'web'"));
    assert_eq!(web.launches + worker.launches, 0);

    assert_eq!(handle.state("cache").unwrap().phase, ServicePhase::Running);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_never_policy_exit_is_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let file = compose(
        r#"
services:
  db:
    command: "exit 1"
    healthcheck:
      test: ["CMD", "true"]
      interval: 1s
  web:
    command: "exec sleep 30"
    depends_on:
      db:
        condition: service_healthy
"#,
    );
    let handle = supervisor(&dir).up(&file, &[]).unwrap();

    let db = wait_for_phase(&handle, "db", ServicePhase::Failed).await;
    assert_eq!(db.launches, 1);
    let web = wait_for_phase(&handle, "web", ServicePhase::Failed).await;
    assert_eq!(web.launches, 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_wait_policy_outlives_failed_dependency() {
    let dir = tempfile::tempdir().unwrap();
    let file = compose(
        r#"
services:
  db:
    command: "exit 1"
    healthcheck:
      test: ["CMD", "true"]
      interval: 1s
  web:
    command: "exec sleep 30"
    depends_on:
      db:
        condition: service_healthy
"#,
    );
    let handle = supervisor_with(&dir, |c| c.dependency_policy = GatePolicy::Wait)
        .up(&file, &[])
        .unwrap();

    wait_for_phase(&handle, "db", ServicePhase::Failed).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let report = handle.status();
    assert_eq!(report.get("web").unwrap().state, ServicePhase::Blocked);
    assert_eq!(report.get("web").unwrap().blocked_on, vec!["db"]);

    handle.shutdown().await;
    assert_eq!(handle.state("web").unwrap().phase, ServicePhase::Stopped);
}

#[tokio::test]
async fn test_completed_successfully_condition() {
    let dir = tempfile::tempdir().unwrap();
    let file = compose(
        r#"
services:
  migrate:
    command: "echo migrating"
  seed:
    command: "exit 2"
  web:
    command: "exec sleep 30"
    depends_on:
      migrate:
        condition: service_completed_successfully
  worker:
    command: "exec sleep 30"
    depends_on:
      seed:
        condition: service_completed_successfully
"#,
    );
    let handle = supervisor(&dir).up(&file, &[]).unwrap();

    let web = wait_for_phase(&handle, "web", ServicePhase::Running).await;
    let migrate = handle.state("migrate").unwrap();
    assert_eq!(migrate.phase, ServicePhase::Exited);
    assert!(migrate.completed_ok);
    assert_eq!(web.launches, 1);

    let worker = wait_for_phase(&handle, "worker", ServicePhase::Failed).await;
    assert!(worker.fault.unwrap().contains("'seed'"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_always_policy_restarts_clean_exits() {
    let dir = tempfile::tempdir().unwrap();
    let file = compose(
        r#"
services:
  ticker:
    command: "exit 0"
    restart: always
    max_restarts: 3
    restart_backoff: 10ms
"#,
    );
    let handle = supervisor(&dir).up(&file, &[]).unwrap();

    let ticker = wait_for_phase(&handle, "ticker", ServicePhase::Failed).await;
    assert_eq!(ticker.launches, 4);
    assert!(ticker.completed_ok);
}

#[tokio::test]
async fn test_stopping_a_dependency_makes_it_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let file = compose(
        r#"
services:
  db:
    command: "exec sleep 30"
    healthcheck:
      test: ["CMD", "false"]
      interval: 50ms
  web:
    command: "exec sleep 30"
    depends_on:
      db:
        condition: service_healthy
"#,
    );
    let handle = supervisor(&dir).up(&file, &[]).unwrap();
    wait_for_phase(&handle, "db", ServicePhase::Running).await;
    let mut events = handle.subscribe_health("db").unwrap();

    handle.stop_service("db").await.unwrap();
    assert_eq!(handle.state("db").unwrap().phase, ServicePhase::Stopped);

    let web = wait_for_phase(&handle, "web", ServicePhase::Failed).await;
    assert!(web.fault.unwrap().contains("unavailable"));

    // The health stream of a torn-down service ends
    while events.recv().await.is_some() {}

    assert!(matches!(
        handle.stop_service("nope").await,
        Err(SupervisorError::UnknownService(_))
    ));
}

#[tokio::test]
async fn test_health_events_and_selection() {
    let dir = tempfile::tempdir().unwrap();
    let file = compose(
        r#"
services:
  db:
    command: "exec sleep 30"
    environment:
      READY_FILE: db.ready
    healthcheck:
      test: ["CMD-SHELL", "touch \"$$READY_FILE\""]
      interval: 50ms
  web:
    command: "exec sleep 30"
    depends_on:
      db:
        condition: service_healthy
  worker:
    command: "exec sleep 30"
"#,
    );
    let handle = supervisor(&dir).up(&file, &["web".to_string()]).unwrap();
    assert_eq!(handle.services().collect::<Vec<_>>(), vec!["db", "web"]);

    let mut events = handle.subscribe_health("db").unwrap();
    let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(event.service, "db");
    assert_eq!(event.from, HealthStatus::Starting);
    assert_eq!(event.to, HealthStatus::Healthy);
    assert!(dir.path().join("db.ready").exists());

    wait_for_phase(&handle, "web", ServicePhase::Running).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn test_wait_returns_once_everything_settled() {
    let dir = tempfile::tempdir().unwrap();
    let file = compose(
        r#"
services:
  job:
    command: "echo done"
  report:
    command: "echo reported"
    depends_on:
      job:
        condition: service_completed_successfully
"#,
    );
    let handle = supervisor(&dir).up(&file, &[]).unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(());

    tokio::time::timeout(WAIT, handle.wait(shutdown_rx)).await.unwrap();
    assert_eq!(handle.state("job").unwrap().phase, ServicePhase::Exited);
    assert_eq!(handle.state("report").unwrap().phase, ServicePhase::Exited);
    assert!(!handle.any_failed());
}
