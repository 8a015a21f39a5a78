//! Automation engines and their lifecycle.
//!
//! Each engine is an independent tokio task ticking on its own interval.
//! [`EngineRunner`] owns the `Stopped -> Running -> Stopped` state machine;
//! stopping cancels the loop between cycles and waits (bounded) for an
//! in-flight cycle to finish its commit.

pub mod batching;
pub mod dispatch;
pub mod escalation;
pub mod reoptimizer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::console;
use crate::error::DispatchError;
use crate::planner::Planner;
use crate::state::FleetState;

pub use batching::BatchingEngine;
pub use dispatch::DispatchEngine;
pub use escalation::EscalationEngine;
pub use reoptimizer::RouteReoptimizer;

/// A periodic control loop over the fleet state.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// Runs one cycle. Returning an error ends the cycle, not the loop.
    async fn run_cycle(&self) -> Result<(), DispatchError>;

    /// Engine-specific counters.
    fn stats(&self) -> BTreeMap<String, u64>;

    /// Called once the loop has exited on stop.
    async fn on_stop(&self) {}
}

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Running,
}

impl EngineState {
    /// ```
    /// use fleet_dispatch::engine::EngineState;
    ///
    /// assert_eq!(EngineState::Running.as_str(), "running");
    /// ```
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Stopped => "stopped",
            EngineState::Running => "running",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

/// Status of one engine as exposed to operators.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub name: String,
    pub state: EngineState,
    pub interval_secs: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub cycles_run: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Progress {
    last_cycle_at: Option<DateTime<Utc>>,
    cycles_run: u64,
    last_error: Option<String>,
}

struct Lifecycle {
    state: EngineState,
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// Drives one [`Engine`] on its interval.
pub struct EngineRunner {
    engine: Arc<dyn Engine>,
    state: Arc<FleetState>,
    lifecycle: Mutex<Lifecycle>,
    progress: Arc<Mutex<Progress>>,
    stop_timeout: Duration,
}

impl EngineRunner {
    pub fn new(engine: Arc<dyn Engine>, state: Arc<FleetState>, stop_timeout: Duration) -> Self {
        Self {
            engine,
            state,
            lifecycle: Mutex::new(Lifecycle {
                state: EngineState::Stopped,
                token: None,
                handle: None,
            }),
            progress: Arc::new(Mutex::new(Progress::default())),
            stop_timeout,
        }
    }

    pub fn name(&self) -> &'static str {
        self.engine.name()
    }

    /// Spawns the loop. Must be called inside a tokio runtime.
    pub fn start(&self) -> StartOutcome {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == EngineState::Running {
            info!(engine = self.name(), "Engine already running");
            return StartOutcome::AlreadyRunning;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.engine),
            Arc::clone(&self.state),
            Arc::clone(&self.progress),
            token.clone(),
        ));
        lifecycle.state = EngineState::Running;
        lifecycle.token = Some(token);
        lifecycle.handle = Some(handle);

        console::print_engine_event(self.name(), "started");
        info!(engine = self.name(), interval_secs = self.engine.interval().as_secs(), "Engine started");
        StartOutcome::Started
    }

    /// Stops the loop after the in-flight cycle, waiting at most the stop timeout.
    pub async fn stop(&self) -> StopOutcome {
        let (token, handle) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == EngineState::Stopped {
                info!(engine = self.name(), "Engine already stopped");
                return StopOutcome::AlreadyStopped;
            }
            lifecycle.state = EngineState::Stopped;
            (lifecycle.token.take(), lifecycle.handle.take())
        };

        if let Some(token) = token {
            token.cancel();
        }
        if let Some(handle) = handle {
            match tokio::time::timeout(self.stop_timeout, handle).await {
                Ok(Ok(())) => self.engine.on_stop().await,
                Ok(Err(e)) => error!(engine = self.name(), error = %e, "Engine task failed"),
                Err(_) => warn!(
                    engine = self.name(),
                    timeout_secs = self.stop_timeout.as_secs(),
                    "In-flight cycle still running at stop timeout, detaching it"
                ),
            }
        }

        console::print_engine_event(self.name(), "stopped");
        info!(engine = self.name(), "Engine stopped");
        StopOutcome::Stopped
    }

    /// Runs a single cycle outside the timer.
    pub async fn run_once(&self) -> Result<(), DispatchError> {
        run_cycle(self.engine.as_ref(), &self.state, &self.progress).await
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.lifecycle.lock().state;
        let progress = self.progress.lock();
        EngineStatus {
            name: self.name().to_string(),
            state,
            interval_secs: self.engine.interval().as_secs(),
            last_cycle_at: progress.last_cycle_at,
            cycles_run: progress.cycles_run,
            last_error: progress.last_error.clone(),
        }
    }

    pub fn stats(&self) -> BTreeMap<String, u64> {
        let mut stats = self.engine.stats();
        stats.insert("cycles_run".into(), self.progress.lock().cycles_run);
        stats
    }
}

async fn run_loop(
    engine: Arc<dyn Engine>,
    state: Arc<FleetState>,
    progress: Arc<Mutex<Progress>>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(engine.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // Cycles are never cancelled mid-way; the token is only checked between them.
        if let Err(e) = run_cycle(engine.as_ref(), &state, &progress).await {
            debug!(engine = engine.name(), error = %e, "Loop continues after failed cycle");
        }
    }
    debug!(engine = engine.name(), "Engine loop exited");
}

async fn run_cycle(
    engine: &dyn Engine,
    state: &FleetState,
    progress: &Mutex<Progress>,
) -> Result<(), DispatchError> {
    let result = engine.run_cycle().await;

    let mut p = progress.lock();
    p.last_cycle_at = Some(state.now());
    p.cycles_run += 1;
    match &result {
        Ok(()) => p.last_error = None,
        Err(e) => {
            p.last_error = Some(e.to_string());
            if let DispatchError::InvariantViolation { route_id, .. } = e {
                state.raise_invariant(Some(route_id.clone()), e.to_string());
                error!(engine = engine.name(), error = %e, "Cycle halted on invariant violation");
            } else {
                warn!(engine = engine.name(), error = %e, "Cycle failed");
            }
        }
    }
    result
}

/// The four automation engines sharing one fleet state.
pub struct Automation {
    runners: Vec<EngineRunner>,
}

impl Automation {
    pub fn new(state: Arc<FleetState>, planner: Arc<Planner>) -> Self {
        let config = planner.config().clone();
        let stop_timeout = Duration::from_secs(config.engines.stop_timeout_secs);
        let engines: Vec<Arc<dyn Engine>> = vec![
            Arc::new(DispatchEngine::new(Arc::clone(&state), Arc::clone(&planner))),
            Arc::new(RouteReoptimizer::new(Arc::clone(&state), Arc::clone(&planner))),
            Arc::new(BatchingEngine::new(Arc::clone(&state), &config)),
            Arc::new(EscalationEngine::new(Arc::clone(&state), &config)),
        ];
        Self {
            runners: engines
                .into_iter()
                .map(|e| EngineRunner::new(e, Arc::clone(&state), stop_timeout))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<&EngineRunner, DispatchError> {
        self.runners
            .iter()
            .find(|r| r.name() == name)
            .ok_or_else(|| DispatchError::NotFound {
                kind: "engine",
                id: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.runners.iter().map(EngineRunner::name).collect()
    }

    pub fn start_all(&self) {
        for runner in &self.runners {
            runner.start();
        }
    }

    pub async fn stop_all(&self) {
        futures::future::join_all(self.runners.iter().map(EngineRunner::stop)).await;
    }

    pub fn statuses(&self) -> Vec<EngineStatus> {
        self.runners.iter().map(EngineRunner::status).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counter {
        cycles: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl Engine for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(30)
        }

        async fn run_cycle(&self) -> Result<(), DispatchError> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DispatchError::InvariantViolation {
                    route_id: "r1".into(),
                    detail: "late stop".into(),
                });
            }
            Ok(())
        }

        fn stats(&self) -> BTreeMap<String, u64> {
            BTreeMap::from([("ticks".to_string(), self.cycles.load(Ordering::SeqCst))])
        }
    }

    fn runner(fail: bool) -> (Arc<FleetState>, EngineRunner) {
        let state = Arc::new(FleetState::new(Arc::new(SystemClock)));
        let engine = Arc::new(Counter {
            cycles: AtomicU64::new(0),
            fail,
        });
        let runner = EngineRunner::new(engine, Arc::clone(&state), Duration::from_secs(5));
        (state, runner)
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let (_, runner) = runner(false);
        assert_eq!(runner.status().state, EngineState::Stopped);
        assert_eq!(runner.start(), StartOutcome::Started);
        assert_eq!(runner.start(), StartOutcome::AlreadyRunning);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(runner.status().cycles_run >= 2);

        assert_eq!(runner.stop().await, StopOutcome::Stopped);
        assert_eq!(runner.stop().await, StopOutcome::AlreadyStopped);
        assert_eq!(runner.status().state, EngineState::Stopped);

        let cycles = runner.status().cycles_run;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(runner.status().cycles_run, cycles);
    }

    #[tokio::test]
    async fn invariant_violation_raises_critical_alert() {
        let (state, runner) = runner(true);
        assert!(runner.run_once().await.is_err());
        let alerts = state.list_alerts(Some(false));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, crate::alerts::Severity::Critical);
        assert!(runner.status().last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cycles_do_not_end_the_loop() {
        let (state, runner) = runner(true);
        runner.start();
        tokio::time::sleep(Duration::from_secs(61)).await;
        runner.stop().await;

        let status = runner.status();
        assert!(status.cycles_run >= 2);
        assert!(status.last_error.is_some());
        assert!(!state.list_alerts(Some(false)).is_empty());
    }

    #[tokio::test]
    async fn stats_include_cycle_count() {
        let (_, runner) = runner(false);
        runner.run_once().await.unwrap();
        let stats = runner.stats();
        assert_eq!(stats["cycles_run"], 1);
        assert_eq!(stats["ticks"], 1);
    }
}
