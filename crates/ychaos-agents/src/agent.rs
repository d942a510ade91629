//! The agent lifecycle framework.
//!
//! An agent is an attack module configured to cause some kind of chaos on the
//! target; the simplest example is the CPU burn agent that consumes CPU
//! during its run window. Every agent advances through the [`AgentState`]
//! machine: the non-negative states form the happy path, the negative states
//! are terminal failures. The free functions at the bottom of this module are
//! the only way the engine starts and stops agents; they enforce the state
//! preconditions, capture errors onto the agent's queue instead of
//! propagating them, and keep the state history consistent.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Errors originated by the lifecycle framework itself.
///
/// Agent bodies report their own failures as plain [`anyhow::Error`] values;
/// both end up on the agent's exception queue, never propagated out of the
/// coordinator.
#[derive(Error, Debug)]
pub enum AgentError {
    /// `run` was entered from a state other than SETUP with strict checking.
    #[error("agent state is not SETUP, bailing out")]
    StateMismatch,

    /// The runnability predicate rejected the agent.
    #[error("agent not in an executable state, bailing out")]
    NotRunnable,

    /// The teardown worker did not finish within the framework timeout.
    #[error("teardown did not complete within {0} seconds")]
    TeardownTimeout(u64),

    /// Any other agent-reported failure.
    #[error("{0}")]
    Failed(String),
}

/// Lifecycle states, totally ordered by their integer value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentState {
    /// Never started; the window closed before the agent became eligible.
    Skipped,
    /// Stopped because the overall run failed.
    Aborted,
    /// A lifecycle method failed.
    Error,
    /// Fallback state; never entered through the normal flow.
    Undefined,
    /// Constructed, waiting for its start time.
    Init,
    /// Resources prepared.
    Setup,
    /// The attack body is executing.
    Running,
    /// The attack body exited (monitored start only).
    Completed,
    /// Reverting host-visible changes.
    Teardown,
    /// Torn down successfully.
    Done,
}

impl AgentState {
    /// The integer value of the state. Negative values are terminal failures.
    pub fn value(&self) -> i8 {
        match self {
            Self::Skipped => -3,
            Self::Aborted => -2,
            Self::Error => -1,
            Self::Undefined => 0,
            Self::Init => 1,
            Self::Setup => 2,
            Self::Running => 3,
            Self::Completed => 4,
            Self::Teardown => 5,
            Self::Done => 6,
        }
    }

    /// Whether this is a terminal-failure state.
    pub fn is_failure(&self) -> bool {
        self.value() < 0
    }

    /// The canonical uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "SKIPPED",
            Self::Aborted => "ABORTED",
            Self::Error => "ERROR",
            Self::Undefined => "UNDEFINED",
            Self::Init => "INIT",
            Self::Setup => "SETUP",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Teardown => "TEARDOWN",
            Self::Done => "DONE",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named priority levels for the agent config `priority` field.
pub mod priority {
    /// Highest priority.
    pub const VERY_HIGH: i32 = 0;
    /// High priority.
    pub const HIGH: i32 = 1;
    /// Moderate priority.
    pub const MODERATE: i32 = 2;
    /// Low priority.
    pub const LOW: i32 = 3;
    /// Lowest priority.
    pub const VERY_LOW: i32 = 4;
    /// No priority assigned.
    pub const UNDEFINED: i32 = -1;
}

/// The configuration fields every agent carries.
///
/// Concrete agent configs flatten these next to their own fields; timed
/// agents additionally carry a `duration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseAgentFields {
    /// A one word identifier for the agent.
    #[serde(default)]
    pub name: String,
    /// Multiline description of the agent in consideration.
    #[serde(default = "default_description")]
    pub description: String,
    /// A priority assigned to the agent.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Setting this to true requires the agent to run as root.
    #[serde(default)]
    pub is_sudo: bool,
    /// Be very careful when setting this key to false. If you are aware of
    /// what you are doing, then go ahead.
    #[serde(default = "default_true")]
    pub raise_on_state_mismatch: bool,
    /// Delay in seconds before running this agent.
    #[serde(default = "default_start_delay")]
    pub start_delay: u64,
}

fn default_description() -> String {
    "An awesome YChaos agent.".to_string()
}

fn default_priority() -> i32 {
    priority::UNDEFINED
}

fn default_true() -> bool {
    true
}

fn default_start_delay() -> u64 {
    10
}

/// The default run window of a timed agent, in seconds.
pub fn default_duration() -> u64 {
    300
}

impl Default for BaseAgentFields {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: default_description(),
            priority: default_priority(),
            is_sudo: false,
            raise_on_state_mismatch: true,
            start_delay: default_start_delay(),
        }
    }
}

impl BaseAgentFields {
    /// Base fields carrying `name` and the documented defaults.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Fill in `fallback` as the name when none was configured.
    pub fn ensure_named(&mut self, fallback: &str) {
        if self.name.is_empty() {
            self.name = fallback.to_string();
        }
    }
}

/// One monitoring observation from an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMonitoringDataPoint {
    /// When the observation was taken.
    pub timestamp: DateTime<Utc>,
    /// The agent state at that instant.
    pub state: AgentState,
    /// Agent-defined observation data.
    pub data: BTreeMap<String, serde_json::Value>,
}

impl AgentMonitoringDataPoint {
    /// A datapoint taken now.
    pub fn now(state: AgentState, data: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            state,
            data,
        }
    }
}

/// The preserved scratchpad an agent carries across its lifecycle: the
/// failure markers the coordinator reports from, plus agent-specific
/// recovery flags (e.g. "icmp was already disabled before the attack").
#[derive(Debug, Default)]
pub struct PreservedState {
    /// A lifecycle method of this agent failed.
    pub has_error: bool,
    /// The agent was aborted because the overall run failed.
    pub is_aborted: bool,
    flags: BTreeMap<String, serde_json::Value>,
}

const ERROR_QUEUE_BOUND: usize = 64;

/// The shared lifecycle handle of one agent.
///
/// The coordinator reads state, queues and the scratchpad from its scheduler
/// task; the agent's runner task mutates them concurrently. Every access goes
/// through the mutexes held inside, so the two sides never race.
pub struct AgentLifecycle {
    states: Mutex<Vec<AgentState>>,
    errors: Mutex<VecDeque<anyhow::Error>>,
    collected_errors: Mutex<Vec<String>>,
    status: Mutex<Vec<AgentMonitoringDataPoint>>,
    preserved: Mutex<PreservedState>,
    cancel: CancellationToken,
    runner_active: watch::Sender<bool>,
}

impl Default for AgentLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentLifecycle {
    /// A fresh lifecycle in the INIT state.
    pub fn new() -> Self {
        Self {
            states: Mutex::new(vec![AgentState::Init]),
            errors: Mutex::new(VecDeque::new()),
            collected_errors: Mutex::new(Vec::new()),
            status: Mutex::new(Vec::new()),
            preserved: Mutex::new(PreservedState::default()),
            cancel: CancellationToken::new(),
            runner_active: watch::Sender::new(false),
        }
    }

    /// Append `state` to the history, suppressing consecutive duplicates.
    pub fn advance_state(&self, state: AgentState) {
        let mut states = self.states.lock();
        if states.last() != Some(&state) {
            states.push(state);
        }
    }

    /// The state the agent is currently in.
    pub fn current_state(&self) -> AgentState {
        self.states
            .lock()
            .last()
            .copied()
            .unwrap_or(AgentState::Undefined)
    }

    /// The state the agent was in before the most recent transition.
    pub fn previous_state(&self) -> Option<AgentState> {
        let states = self.states.lock();
        states.len().checked_sub(2).map(|index| states[index])
    }

    /// A snapshot of the full state history.
    pub fn state_history(&self) -> Vec<AgentState> {
        self.states.lock().clone()
    }

    /// Capture an error onto the bounded exception queue.
    pub fn record_error(&self, error: anyhow::Error) {
        let mut errors = self.errors.lock();
        if errors.len() < ERROR_QUEUE_BOUND {
            errors.push_back(error);
        }
    }

    /// Whether the exception queue holds anything.
    pub fn has_errors(&self) -> bool {
        !self.errors.lock().is_empty()
    }

    /// Drain the exception queue into the durable collected list, logging
    /// each entry, and return the full collected list.
    pub fn collect_errors(&self) -> Vec<String> {
        let drained: Vec<anyhow::Error> = self.errors.lock().drain(..).collect();
        let mut collected = self.collected_errors.lock();
        for error in drained {
            tracing::error!(error = format!("{error:#}"), "error occurred in agent");
            collected.push(format!("{error:#}"));
        }
        collected.clone()
    }

    /// The durable error list accumulated by [`Self::collect_errors`].
    pub fn collected_errors(&self) -> Vec<String> {
        self.collected_errors.lock().clone()
    }

    /// Push a monitoring datapoint onto the LIFO status queue.
    pub fn push_status(&self, datapoint: AgentMonitoringDataPoint) {
        self.status.lock().push(datapoint);
    }

    /// Pop the most recent monitoring datapoint.
    pub fn pop_status(&self) -> Option<AgentMonitoringDataPoint> {
        self.status.lock().pop()
    }

    /// Snapshot the status queue, oldest first.
    pub fn status_snapshot(&self) -> Vec<AgentMonitoringDataPoint> {
        self.status.lock().clone()
    }

    /// Read or mutate the preserved scratchpad.
    pub fn with_preserved<T>(&self, f: impl FnOnce(&mut PreservedState) -> T) -> T {
        f(&mut self.preserved.lock())
    }

    /// Store an agent-specific recovery flag.
    pub fn set_flag(&self, key: &str, value: impl Into<serde_json::Value>) {
        self.preserved.lock().flags.insert(key.to_string(), value.into());
    }

    /// Read back an agent-specific recovery flag.
    pub fn flag(&self, key: &str) -> Option<serde_json::Value> {
        self.preserved.lock().flags.get(key).cloned()
    }

    /// The cooperative stop token `run` bodies poll.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request the run body to return at its next checkpoint.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Whether a stop was requested.
    pub fn stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the runner task is currently executing the run body.
    pub fn runner_alive(&self) -> bool {
        *self.runner_active.borrow()
    }

    fn set_runner_active(&self, active: bool) {
        self.runner_active.send_replace(active);
    }

    async fn wait_runner_exit(&self) {
        let mut receiver = self.runner_active.subscribe();
        // Ignore a closed channel: sender lives as long as the lifecycle.
        let _ = receiver.wait_for(|active| !active).await;
    }
}

/// One concrete failure injector.
///
/// The lifecycle methods hold the attack logic only; state bookkeeping,
/// precondition checks and error capture belong to the guarded entry points
/// below, which are the only callers.
#[async_trait]
pub trait Agent: Send + Sync {
    /// The shared base configuration fields.
    fn base(&self) -> &BaseAgentFields;

    /// The configured run window in seconds, for timed agents.
    fn duration(&self) -> Option<u64> {
        None
    }

    /// The shared lifecycle handle.
    fn lifecycle(&self) -> &AgentLifecycle;

    /// Prepare local resources. On success the framework advances to SETUP.
    async fn setup(&self) -> anyhow::Result<()>;

    /// Perform the attack. Blocks until the attack body is done or the
    /// cooperative stop token fires.
    async fn run(&self) -> anyhow::Result<()>;

    /// Revert any host-visible change made by `run`.
    async fn teardown(&self) -> anyhow::Result<()>;

    /// Collect a datapoint onto the status queue. Safe to call from any
    /// state; must not block beyond a short probe.
    async fn monitor(&self) {
        let lifecycle = self.lifecycle();
        lifecycle.push_status(AgentMonitoringDataPoint::now(
            lifecycle.current_state(),
            BTreeMap::new(),
        ));
    }

    /// The configured agent name.
    fn name(&self) -> &str {
        &self.base().name
    }
}

/// Fail-fast predicate: false when the agent is in a failure state, has
/// queued errors, or requires root privileges the process does not hold.
pub fn is_runnable(agent: &dyn Agent) -> bool {
    if agent.lifecycle().current_state().is_failure() {
        return false;
    }
    if agent.lifecycle().has_errors() {
        return false;
    }
    if agent.base().is_sudo && !nix::unistd::geteuid().is_root() {
        return false;
    }
    true
}

fn log_lifecycle(agent: &dyn Agent, method: &'static str, phase: &'static str) {
    info!(
        event = "agents.lifecycle",
        agent = agent.name(),
        method,
        phase,
        state = %agent.lifecycle().current_state(),
    );
}

/// Run `setup` under the lifecycle contract: advance to SETUP on success.
/// Errors propagate to the caller (the coordinator captures them).
pub async fn setup_guarded(agent: &dyn Agent) -> anyhow::Result<()> {
    log_lifecycle(agent, "setup", "start");
    let result = agent.setup().await;
    if result.is_ok() {
        agent.lifecycle().advance_state(AgentState::Setup);
    }
    log_lifecycle(agent, "setup", "end");
    result
}

/// Run the attack body under the lifecycle contract.
///
/// The SETUP precondition is checked first: a mismatch aborts the agent when
/// strict checking is on, and otherwise records a warning and proceeds. The
/// state advances to RUNNING before any work happens.
pub async fn run_guarded(agent: &dyn Agent) -> anyhow::Result<()> {
    let lifecycle = agent.lifecycle();
    if lifecycle.current_state() != AgentState::Setup {
        if agent.base().raise_on_state_mismatch {
            lifecycle.advance_state(AgentState::Aborted);
            return Err(AgentError::StateMismatch.into());
        }
        warn!(
            agent = agent.name(),
            "agent is currently not in the SETUP state, proceeding anyway"
        );
    }
    if !is_runnable(agent) {
        return Err(AgentError::NotRunnable.into());
    }
    lifecycle.advance_state(AgentState::Running);
    log_lifecycle(agent, "run", "start");
    let result = agent.run().await;
    log_lifecycle(agent, "run", "end");
    result
}

/// Launch the attack body on a worker task.
///
/// Any error is captured onto the agent's exception queue and moves the
/// agent to ERROR; nothing propagates out of the worker.
pub fn start_async(agent: Arc<dyn Agent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let lifecycle = agent.lifecycle();
        lifecycle.set_runner_active(true);
        if let Err(error) = run_guarded(agent.as_ref()).await {
            lifecycle.record_error(error);
            lifecycle.advance_state(AgentState::Error);
        }
        lifecycle.set_runner_active(false);
    })
}

/// Blocking start: launch the runner and invoke `callback` every `interval`
/// until it exits, then advance to COMPLETED or ERROR depending on the
/// exception queue.
pub async fn start(agent: Arc<dyn Agent>, interval: Duration, mut callback: impl FnMut()) {
    let mut runner = start_async(Arc::clone(&agent));
    loop {
        tokio::select! {
            _ = &mut runner => break,
            _ = tokio::time::sleep(interval) => callback(),
        }
    }
    let lifecycle = agent.lifecycle();
    if lifecycle.has_errors() {
        lifecycle.advance_state(AgentState::Error);
    } else {
        lifecycle.advance_state(AgentState::Completed);
    }
}

/// Launch teardown on a worker task: advance to TEARDOWN, set the
/// cooperative stop flag, wait for the runner to exit, then revert. Reaches
/// DONE on success, ERROR (with the error captured) on failure.
pub fn teardown_async(agent: Arc<dyn Agent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let lifecycle = agent.lifecycle();
        lifecycle.advance_state(AgentState::Teardown);
        lifecycle.request_stop();
        if lifecycle.runner_alive() {
            lifecycle.wait_runner_exit().await;
        }
        log_lifecycle(agent.as_ref(), "teardown", "start");
        let result = agent.teardown().await;
        log_lifecycle(agent.as_ref(), "teardown", "end");
        match result {
            Ok(()) => lifecycle.advance_state(AgentState::Done),
            Err(error) => {
                lifecycle.record_error(error);
                lifecycle.advance_state(AgentState::Error);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ProbeAgent {
        base: BaseAgentFields,
        lifecycle: AgentLifecycle,
        fail_run: bool,
    }

    impl ProbeAgent {
        fn new(fail_run: bool) -> Self {
            Self {
                base: BaseAgentFields::named("probe"),
                lifecycle: AgentLifecycle::new(),
                fail_run,
            }
        }
    }

    #[async_trait]
    impl Agent for ProbeAgent {
        fn base(&self) -> &BaseAgentFields {
            &self.base
        }

        fn lifecycle(&self) -> &AgentLifecycle {
            &self.lifecycle
        }

        async fn setup(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn run(&self) -> anyhow::Result<()> {
            if self.fail_run {
                anyhow::bail!("attack body broke");
            }
            Ok(())
        }

        async fn teardown(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn state_values_are_totally_ordered() {
        assert_eq!(AgentState::Skipped.value(), -3);
        assert_eq!(AgentState::Done.value(), 6);
        assert!(AgentState::Skipped < AgentState::Error);
        assert!(AgentState::Init < AgentState::Setup);
        assert!(AgentState::Error.is_failure());
        assert!(!AgentState::Init.is_failure());
    }

    #[test]
    fn advance_state_suppresses_consecutive_duplicates() {
        let lifecycle = AgentLifecycle::new();
        lifecycle.advance_state(AgentState::Setup);
        lifecycle.advance_state(AgentState::Setup);
        lifecycle.advance_state(AgentState::Running);
        assert_eq!(
            lifecycle.state_history(),
            vec![AgentState::Init, AgentState::Setup, AgentState::Running]
        );
    }

    #[tokio::test]
    async fn happy_path_reaches_done_through_the_full_progression() {
        let agent: Arc<dyn Agent> = Arc::new(ProbeAgent::new(false));
        setup_guarded(agent.as_ref()).await.expect("setup");
        start_async(Arc::clone(&agent)).await.expect("runner");
        teardown_async(Arc::clone(&agent)).await.expect("stopper");

        let history = agent.lifecycle().state_history();
        assert_eq!(
            history,
            vec![
                AgentState::Init,
                AgentState::Setup,
                AgentState::Running,
                AgentState::Teardown,
                AgentState::Done
            ]
        );
    }

    #[tokio::test]
    async fn run_from_init_with_strict_checking_aborts() {
        let agent: Arc<dyn Agent> = Arc::new(ProbeAgent::new(false));
        start_async(Arc::clone(&agent)).await.expect("runner");

        let lifecycle = agent.lifecycle();
        assert!(lifecycle.has_errors());
        let history = lifecycle.state_history();
        assert!(history.contains(&AgentState::Aborted));
        assert!(!history.contains(&AgentState::Running));
        assert_eq!(lifecycle.current_state(), AgentState::Error);
    }

    #[tokio::test]
    async fn run_from_init_without_strict_checking_proceeds() {
        let mut probe = ProbeAgent::new(false);
        probe.base.raise_on_state_mismatch = false;
        let agent: Arc<dyn Agent> = Arc::new(probe);
        start_async(Arc::clone(&agent)).await.expect("runner");

        let history = agent.lifecycle().state_history();
        assert!(history.contains(&AgentState::Running));
        assert!(!history.contains(&AgentState::Aborted));
        assert!(!agent.lifecycle().has_errors());
    }

    #[tokio::test]
    async fn run_errors_are_captured_not_propagated() {
        let agent: Arc<dyn Agent> = Arc::new(ProbeAgent::new(true));
        setup_guarded(agent.as_ref()).await.expect("setup");
        start_async(Arc::clone(&agent)).await.expect("runner");

        assert_eq!(agent.lifecycle().current_state(), AgentState::Error);
        assert!(agent.lifecycle().has_errors());
        assert!(!is_runnable(agent.as_ref()));
    }

    #[tokio::test]
    async fn monitored_start_advances_to_completed() {
        let agent: Arc<dyn Agent> = Arc::new(ProbeAgent::new(false));
        setup_guarded(agent.as_ref()).await.expect("setup");

        let ticks = AtomicUsize::new(0);
        start(Arc::clone(&agent), Duration::from_millis(10), || {
            ticks.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        assert_eq!(agent.lifecycle().current_state(), AgentState::Completed);
    }

    #[tokio::test]
    async fn cooperative_stop_interrupts_a_long_run() {
        struct SleepyAgent {
            base: BaseAgentFields,
            lifecycle: AgentLifecycle,
        }

        #[async_trait]
        impl Agent for SleepyAgent {
            fn base(&self) -> &BaseAgentFields {
                &self.base
            }

            fn lifecycle(&self) -> &AgentLifecycle {
                &self.lifecycle
            }

            async fn setup(&self) -> anyhow::Result<()> {
                Ok(())
            }

            async fn run(&self) -> anyhow::Result<()> {
                let cancel = self.lifecycle.cancel_token();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
                    _ = cancel.cancelled() => {}
                }
                Ok(())
            }

            async fn teardown(&self) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let agent: Arc<dyn Agent> = Arc::new(SleepyAgent {
            base: BaseAgentFields::named("sleepy"),
            lifecycle: AgentLifecycle::new(),
        });
        setup_guarded(agent.as_ref()).await.expect("setup");
        let _runner = start_async(Arc::clone(&agent));
        // Give the runner a beat to enter its select.
        tokio::time::sleep(Duration::from_millis(50)).await;

        teardown_async(Arc::clone(&agent)).await.expect("stopper");
        assert_eq!(agent.lifecycle().current_state(), AgentState::Done);
    }

    #[test]
    fn collected_errors_stay_on_the_agent() {
        let lifecycle = AgentLifecycle::new();
        lifecycle.record_error(anyhow::anyhow!("first"));
        lifecycle.record_error(anyhow::anyhow!("second"));

        let collected = lifecycle.collect_errors();
        assert_eq!(collected.len(), 2);
        assert!(!lifecycle.has_errors());
        assert_eq!(lifecycle.collected_errors(), collected);
    }

    #[test]
    fn preserved_flags_round_trip() {
        let lifecycle = AgentLifecycle::new();
        lifecycle.set_flag("ping_already_disabled", true);
        assert_eq!(
            lifecycle.flag("ping_already_disabled"),
            Some(serde_json::Value::Bool(true))
        );
        assert_eq!(lifecycle.flag("missing"), None);
    }
}
