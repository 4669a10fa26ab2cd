//! Health monitoring
//!
//! Each launched service with a probe gets a [`HealthMonitor`] task that
//! polls its [`ProbeRunner`] and derives a tri-state [`HealthStatus`] from
//! consecutive outcomes. The monitor is the only writer of a service's
//! health: it owns the [`HealthPublisher`] while it runs and hands it back
//! when stopped, so a restarted process gets a fresh monitor writing to the
//! same channel. Everyone else reads through a [`HealthFeed`].

use crate::runtime::probe::{ProbeResult, ProbeRunner, ProbeSpec};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Health status derived from consecutive probe outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Status plus the consecutive success/failure streak
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthState {
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: HealthStatus::Starting,
            consecutive_successes: 0,
            consecutive_failures: 0,
        }
    }
}

impl HealthState {
    /// Apply one probe outcome and return the new status if it changed
    ///
    /// Uncounted failures (inside the start period) leave the state untouched.
    pub fn record(&mut self, success: bool, counted: bool, spec: &ProbeSpec) -> Option<HealthStatus> {
        if success {
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.consecutive_failures = 0;
            if self.status != HealthStatus::Healthy
                && self.consecutive_successes >= spec.success_threshold.max(1)
            {
                self.status = HealthStatus::Healthy;
                return Some(HealthStatus::Healthy);
            }
        } else if counted {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.consecutive_successes = 0;
            if self.status != HealthStatus::Unhealthy
                && self.consecutive_failures >= spec.retries.max(1)
            {
                self.status = HealthStatus::Unhealthy;
                return Some(HealthStatus::Unhealthy);
            }
        }
        None
    }
}

/// Point-in-time view of a service's health
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    pub state: HealthState,
    /// First time the service was ever observed healthy (kept across restarts)
    pub first_healthy_at: Option<Instant>,
    /// Time of the latest status transition
    pub last_transition_at: Option<Instant>,
    /// Latest probe result
    pub last_result: Option<ProbeResult>,
    /// Probes executed by the current monitor
    pub probes: u64,
    /// Whether a monitor is currently running
    pub monitoring: bool,
}

impl HealthSnapshot {
    pub fn status(&self) -> HealthStatus {
        self.state.status
    }

    /// Whether the service has been healthy at least once
    pub fn ever_healthy(&self) -> bool {
        self.first_healthy_at.is_some()
    }
}

/// A status transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub service: String,
    pub from: HealthStatus,
    pub to: HealthStatus,
    pub at: Instant,
    /// Output of the probe that caused the transition
    pub output: String,
}

#[derive(Debug, Default)]
struct Subscribers {
    closed: bool,
    senders: Vec<mpsc::UnboundedSender<HealthEvent>>,
}

type SharedSubscribers = Arc<Mutex<Subscribers>>;

fn lock(subscribers: &SharedSubscribers) -> MutexGuard<'_, Subscribers> {
    subscribers.lock().unwrap_or_else(|e| e.into_inner())
}

/// Create the health channel of one service
pub fn health_channel(service: &str) -> (HealthPublisher, HealthFeed) {
    let (tx, rx) = watch::channel(HealthSnapshot::default());
    let subscribers = SharedSubscribers::default();
    (
        HealthPublisher {
            service: service.to_string(),
            tx,
            subscribers: Arc::clone(&subscribers),
        },
        HealthFeed { rx, subscribers },
    )
}

/// Write side of a service's health; exactly one exists per service
#[derive(Debug)]
pub struct HealthPublisher {
    service: String,
    tx: watch::Sender<HealthSnapshot>,
    subscribers: SharedSubscribers,
}

impl HealthPublisher {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Start a new monitoring period: back to `starting`, streaks cleared
    ///
    /// Leaving `healthy` or `unhealthy` this way is a transition too.
    fn begin(&self) {
        let now = Instant::now();
        let mut event = None;

        self.tx.send_modify(|snapshot| {
            let from = snapshot.state.status;
            snapshot.state = HealthState::default();
            snapshot.probes = 0;
            snapshot.monitoring = true;
            if from != HealthStatus::Starting {
                snapshot.last_transition_at = Some(now);
                event = Some(HealthEvent {
                    service: self.service.clone(),
                    from,
                    to: HealthStatus::Starting,
                    at: now,
                    output: String::new(),
                });
            }
        });

        if let Some(event) = &event {
            self.emit(event);
        }
    }

    fn emit(&self, event: &HealthEvent) {
        let mut subscribers = lock(&self.subscribers);
        subscribers
            .senders
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Mark monitoring as paused (process exited or is being restarted)
    fn pause(&self) {
        self.tx.send_modify(|snapshot| snapshot.monitoring = false);
    }

    /// Record a probe outcome, emitting an event on transitions
    fn record(&self, result: ProbeResult, counted: bool, spec: &ProbeSpec) -> Option<HealthEvent> {
        let now = Instant::now();
        let mut event = None;

        self.tx.send_modify(|snapshot| {
            snapshot.probes += 1;
            let from = snapshot.state.status;
            if let Some(to) = snapshot.state.record(result.success, counted, spec) {
                snapshot.last_transition_at = Some(now);
                if to == HealthStatus::Healthy && snapshot.first_healthy_at.is_none() {
                    snapshot.first_healthy_at = Some(now);
                }
                event = Some(HealthEvent {
                    service: self.service.clone(),
                    from,
                    to,
                    at: now,
                    output: result.output.clone(),
                });
            }
            snapshot.last_result = Some(result);
        });

        if let Some(event) = &event {
            self.emit(event);
        }

        event
    }

    /// Tear down: end every event stream; later subscriptions end immediately
    pub fn close(self) {
        self.pause();
        let mut subscribers = lock(&self.subscribers);
        subscribers.closed = true;
        subscribers.senders.clear();
    }
}

/// Read side of a service's health
#[derive(Debug, Clone)]
pub struct HealthFeed {
    rx: watch::Receiver<HealthSnapshot>,
    subscribers: SharedSubscribers,
}

impl HealthFeed {
    /// Current snapshot
    pub fn snapshot(&self) -> HealthSnapshot {
        self.rx.borrow().clone()
    }

    /// Receiver that wakes on every snapshot change
    pub fn watch(&self) -> watch::Receiver<HealthSnapshot> {
        self.rx.clone()
    }

    /// Ordered stream of status transitions from now on
    ///
    /// The stream ends when the service is torn down.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HealthEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = lock(&self.subscribers);
        if !subscribers.closed {
            subscribers.senders.push(tx);
        }
        rx
    }
}

/// Periodic probe task for one launched process
pub struct HealthMonitor {
    spec: ProbeSpec,
    runner: Arc<dyn ProbeRunner>,
    publisher: HealthPublisher,
}

impl HealthMonitor {
    pub fn new(spec: ProbeSpec, runner: Arc<dyn ProbeRunner>, publisher: HealthPublisher) -> Self {
        Self {
            spec,
            runner,
            publisher,
        }
    }

    /// Start monitoring a process launched at `launched_at`
    pub fn spawn(self, launched_at: Instant) -> MonitorHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(self.run(launched_at, stop_rx));
        MonitorHandle { stop_tx, join }
    }

    async fn run(self, launched_at: Instant, mut stop_rx: oneshot::Receiver<()>) -> HealthPublisher {
        let name = self.publisher.service().to_string();
        self.publisher.begin();

        let grace_until = deadline(launched_at, self.spec.start_period);
        let mut grace_over = self.spec.start_period.is_zero();

        log::debug!(
            "[{}] Health monitor started: {} every {:?} (start period {:?})",
            name,
            self.spec.command,
            self.spec.interval,
            self.spec.start_period
        );

        loop {
            let now = Instant::now();
            let next = if !grace_over && now < grace_until {
                match self.spec.start_interval {
                    Some(start_interval) => deadline(now, start_interval),
                    None => grace_until,
                }
            } else {
                deadline(now, self.spec.interval)
            };

            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                _ = tokio::time::sleep_until(next) => {}
            }

            let result = tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                result = self.runner.run(&self.spec) => result,
            };

            // A success inside the start period ends it early
            if result.success || Instant::now() >= grace_until {
                grace_over = true;
            }
            let counted = grace_over;

            if !result.success {
                if counted {
                    log::debug!("[{}] Probe failed: {}", name, result.output.trim());
                } else {
                    log::trace!("[{}] Probe failed inside start period, not counted", name);
                }
            }

            if let Some(event) = self.publisher.record(result, counted, &self.spec) {
                match event.to {
                    HealthStatus::Healthy => log::info!("[{}] Service is healthy", name),
                    HealthStatus::Unhealthy => log::warn!(
                        "[{}] Service is unhealthy: {}",
                        name,
                        event.output.trim()
                    ),
                    HealthStatus::Starting => {}
                }
            }
        }

        log::debug!("[{}] Health monitor stopped", name);
        self.publisher.pause();
        self.publisher
    }
}

/// `from + after`, saturating at a far-future instant
fn deadline(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .unwrap_or_else(|| from + Duration::from_secs(FAR_FUTURE_SECS))
}

const FAR_FUTURE_SECS: u64 = 30 * 365 * 24 * 60 * 60;

/// Handle to a running monitor
pub struct MonitorHandle {
    stop_tx: oneshot::Sender<()>,
    join: JoinHandle<HealthPublisher>,
}

impl MonitorHandle {
    /// Stop the monitor, cancelling any in-flight probe, and take back the publisher
    pub async fn stop(self) -> Option<HealthPublisher> {
        let _ = self.stop_tx.send(());
        match self.join.await {
            Ok(publisher) => Some(publisher),
            Err(e) => {
                log::error!("Health monitor task failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::probe::ProbeCommand;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Replays a scripted list of outcomes; the last one repeats forever
    struct ScriptedProbe {
        outcomes: Mutex<VecDeque<bool>>,
        last: bool,
    }

    impl ScriptedProbe {
        fn new(outcomes: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                last: *outcomes.last().unwrap(),
            })
        }
    }

    #[async_trait]
    impl ProbeRunner for ScriptedProbe {
        async fn run(&self, _spec: &ProbeSpec) -> ProbeResult {
            let success = self.outcomes.lock().unwrap().pop_front().unwrap_or(self.last);
            ProbeResult {
                success,
                duration: Duration::ZERO,
                exit_code: Some(if success { 0 } else { 1 }),
                output: if success { "ok" } else { "refused" }.to_string(),
            }
        }
    }

    fn spec() -> ProbeSpec {
        ProbeSpec::new(ProbeCommand::Shell("pg_isready".to_string()))
    }

    #[test]
    fn test_starting_to_healthy_on_first_success() {
        let mut state = HealthState::default();
        assert_eq!(state.record(true, true, &spec()), Some(HealthStatus::Healthy));
        assert_eq!(state.consecutive_successes, 1);
        // Further successes are not transitions
        assert_eq!(state.record(true, true, &spec()), None);
    }

    #[test]
    fn test_unhealthy_after_retries_failures() {
        let spec = spec().retries(3);
        let mut state = HealthState::default();
        assert_eq!(state.record(false, true, &spec), None);
        assert_eq!(state.record(false, true, &spec), None);
        assert_eq!(state.record(false, true, &spec), Some(HealthStatus::Unhealthy));
        assert_eq!(state.consecutive_failures, 3);
        assert_eq!(state.consecutive_successes, 0);
    }

    #[test]
    fn test_counters_are_mutually_exclusive() {
        let spec = spec().retries(3);
        let mut state = HealthState::default();
        state.record(false, true, &spec);
        state.record(false, true, &spec);
        state.record(true, true, &spec);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.consecutive_successes, 1);
        state.record(false, true, &spec);
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.consecutive_successes, 0);
    }

    #[test]
    fn test_healthy_and_unhealthy_flip_both_ways() {
        let spec = spec().retries(2);
        let mut state = HealthState::default();
        assert_eq!(state.record(true, true, &spec), Some(HealthStatus::Healthy));
        state.record(false, true, &spec);
        assert_eq!(state.record(false, true, &spec), Some(HealthStatus::Unhealthy));
        assert_eq!(state.record(true, true, &spec), Some(HealthStatus::Healthy));
    }

    #[test]
    fn test_uncounted_failures_are_ignored() {
        let spec = spec().retries(1);
        let mut state = HealthState::default();
        for _ in 0..10 {
            assert_eq!(state.record(false, false, &spec), None);
        }
        assert_eq!(state, HealthState::default());
    }

    #[test]
    fn test_success_threshold() {
        let spec = spec().success_threshold(3);
        let mut state = HealthState::default();
        assert_eq!(state.record(true, true, &spec), None);
        assert_eq!(state.record(true, true, &spec), None);
        assert_eq!(state.record(true, true, &spec), Some(HealthStatus::Healthy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_probe_never_becomes_healthy() {
        // retries=5, interval=10s, start_period=10s
        let spec = spec()
            .retries(5)
            .interval(Duration::from_secs(10))
            .start_period(Duration::from_secs(10));
        let (publisher, feed) = health_channel("db");
        let mut events = feed.subscribe();

        let launched_at = Instant::now();
        let monitor =
            HealthMonitor::new(spec, ScriptedProbe::new(&[false]), publisher).spawn(launched_at);

        tokio::time::sleep(Duration::from_secs(600)).await;
        let snapshot = feed.snapshot();
        assert_eq!(snapshot.status(), HealthStatus::Unhealthy);
        assert!(!snapshot.ever_healthy());

        // First counted probe at 10s, fifth consecutive failure at 50s
        let event = events.recv().await.unwrap();
        assert_eq!(event.from, HealthStatus::Starting);
        assert_eq!(event.to, HealthStatus::Unhealthy);
        assert_eq!(event.at - launched_at, Duration::from_secs(50));
        assert!(events.try_recv().is_err());

        monitor.stop().await.unwrap().close();
        assert!(events.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_probes_before_start_period_without_start_interval() {
        let spec = spec()
            .interval(Duration::from_secs(10))
            .start_period(Duration::from_secs(10));
        let (publisher, feed) = health_channel("db");
        let monitor =
            HealthMonitor::new(spec, ScriptedProbe::new(&[false]), publisher).spawn(Instant::now());

        tokio::time::sleep(Duration::from_millis(9_500)).await;
        assert_eq!(feed.snapshot().probes, 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(feed.snapshot().probes, 1);
        assert_eq!(feed.snapshot().state.consecutive_failures, 1);

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_inside_start_period_are_not_counted() {
        let spec = spec()
            .retries(1)
            .interval(Duration::from_secs(10))
            .start_period(Duration::from_secs(10))
            .start_interval(Duration::from_secs(1));
        let (publisher, feed) = health_channel("db");
        let monitor =
            HealthMonitor::new(spec, ScriptedProbe::new(&[false]), publisher).spawn(Instant::now());

        tokio::time::sleep(Duration::from_millis(9_500)).await;
        let snapshot = feed.snapshot();
        assert_eq!(snapshot.probes, 9);
        assert_eq!(snapshot.state.consecutive_failures, 0);
        assert_eq!(snapshot.status(), HealthStatus::Starting);

        // The first probe after the start period counts
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(feed.snapshot().status(), HealthStatus::Unhealthy);

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_inside_start_period_counts() {
        let spec = spec()
            .retries(1)
            .interval(Duration::from_secs(5))
            .start_period(Duration::from_secs(60))
            .start_interval(Duration::from_secs(1));
        let (publisher, feed) = health_channel("db");
        let launched_at = Instant::now();
        let monitor = HealthMonitor::new(
            spec,
            ScriptedProbe::new(&[false, false, true, false]),
            publisher,
        )
        .spawn(launched_at);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let snapshot = feed.snapshot();
        assert_eq!(snapshot.status(), HealthStatus::Healthy);
        assert_eq!(snapshot.first_healthy_at.unwrap() - launched_at, Duration::from_secs(3));

        // The start period ended with the success, so the next failure counts
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(feed.snapshot().status(), HealthStatus::Unhealthy);

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_emitted_in_order() {
        let spec = spec().retries(2).interval(Duration::from_secs(1));
        let (publisher, feed) = health_channel("db");
        let mut events = feed.subscribe();
        let monitor = HealthMonitor::new(
            spec,
            ScriptedProbe::new(&[false, false, true, false, false, true]),
            publisher,
        )
        .spawn(Instant::now());

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = events.recv().await.unwrap();
            seen.push((event.from, event.to));
        }
        assert_eq!(
            seen,
            vec![
                (HealthStatus::Starting, HealthStatus::Unhealthy),
                (HealthStatus::Unhealthy, HealthStatus::Healthy),
                (HealthStatus::Healthy, HealthStatus::Unhealthy),
            ]
        );

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_intervals_do_not_kill_the_monitor() {
        let spec = spec()
            .interval(Duration::MAX)
            .start_period(Duration::MAX);
        let (publisher, feed) = health_channel("db");

        let monitor = HealthMonitor::new(spec, ScriptedProbe::new(&[true]), publisher)
            .spawn(Instant::now());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(feed.snapshot().probes, 0);
        assert!(feed.snapshot().monitoring);

        // The publisher comes back, so the task did not panic
        assert!(monitor.stop().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarted_monitor_keeps_first_healthy_time() {
        let spec = spec().interval(Duration::from_secs(1));
        let (publisher, feed) = health_channel("db");
        let mut events = feed.subscribe();

        let monitor = HealthMonitor::new(spec.clone(), ScriptedProbe::new(&[true]), publisher)
            .spawn(Instant::now());
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let first_healthy = feed.snapshot().first_healthy_at.unwrap();
        let publisher = monitor.stop().await.unwrap();
        assert!(!feed.snapshot().monitoring);

        let event = events.try_recv().unwrap();
        assert_eq!((event.from, event.to), (HealthStatus::Starting, HealthStatus::Healthy));

        let monitor = HealthMonitor::new(spec, ScriptedProbe::new(&[false]), publisher)
            .spawn(Instant::now());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = feed.snapshot();
        assert!(snapshot.monitoring);
        assert_eq!(snapshot.status(), HealthStatus::Starting);
        assert_eq!(snapshot.first_healthy_at, Some(first_healthy));

        // The reset to starting is reported like any other transition
        let event = events.try_recv().unwrap();
        assert_eq!((event.from, event.to), (HealthStatus::Healthy, HealthStatus::Starting));
        assert!(events.try_recv().is_err());

        monitor.stop().await.unwrap().close();
        // Subscriptions after teardown end immediately
        assert!(feed.subscribe().recv().await.is_none());
    }
}
