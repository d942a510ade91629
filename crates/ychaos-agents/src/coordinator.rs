//! The per-host attack coordinator.
//!
//! The coordinator configures the agents of one test plan, computes their
//! absolute start/end instants, drives them through a 1 Hz scheduler loop
//! within the attack window, enforces the teardown barrier, and produces the
//! structured attack report that is the single durable artefact of a run.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use ychaos_core::hooks::{EventListener, HookError, HookEvent, HookRegistry};
use ychaos_core::testplan::TestPlan;
use ychaos_core::PlanError;

use crate::agent::{
    setup_guarded, start_async, teardown_async, Agent, AgentError, AgentState,
};
use crate::registry;

/// Run window, in seconds, assumed for agents without a configured duration.
pub const DEFAULT_DURATION: u64 = 3;

/// Seconds the teardown barrier waits for each teardown worker.
pub const TEARDOWN_TIMEOUT: u64 = 300;

/// Sentinel reported as `end_time` for agents that are not timed.
const UNTIMED_END_TIME: &str = "NaN";

/// Errors surfaced by the coordinator itself.
///
/// Agent failures never take this path: they are captured on the agents and
/// reflected in the report and exit code.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The attack was started before the agents were configured.
    #[error("coordinator has no configured agents, call configure_agents_in_plan first")]
    NotConfigured,

    /// A plan configuration problem surfaced while building the agents.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// A raising hook listener failed.
    #[error(transparent)]
    Hook(#[from] HookError),
}

/// Lifecycle events fired by the coordinator.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// The attack started on this host.
    AttackStart,
    /// The attack completed, successfully or not.
    AttackCompleted,
    /// An agent started executing.
    AgentStart {
        /// Name of the agent.
        agent: String,
    },
    /// An agent's teardown was launched.
    AgentTeardown {
        /// Name of the agent.
        agent: String,
    },
    /// An agent finished execution and teardown.
    AgentStop {
        /// Name of the agent.
        agent: String,
    },
}

impl HookEvent for CoordinatorEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::AttackStart => "on_attack_start",
            Self::AttackCompleted => "on_attack_completed",
            Self::AgentStart { .. } => "on_each_agent_start",
            Self::AgentTeardown { .. } => "on_each_agent_teardown",
            Self::AgentStop { .. } => "on_each_agent_stop",
        }
    }
}

/// The events external collaborators can register hooks for.
pub const COORDINATOR_EVENTS: &[&str] = &[
    "on_attack_start",
    "on_attack_completed",
    "on_each_agent_start",
    "on_each_agent_teardown",
    "on_each_agent_stop",
];

/// An agent paired with its computed attack window and worker handles.
pub struct ConfiguredAgent {
    /// The agent itself.
    pub agent: Arc<dyn Agent>,
    /// Absolute instant at which the agent becomes eligible to run.
    pub start_time: DateTime<Utc>,
    /// Absolute instant at which the agent becomes eligible for teardown.
    pub end_time: DateTime<Utc>,
    runner: Option<JoinHandle<()>>,
    teardown: Option<JoinHandle<()>>,
}

impl ConfiguredAgent {
    fn new(agent: Arc<dyn Agent>, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            agent,
            start_time,
            end_time,
            runner: None,
            teardown: None,
        }
    }

    fn runner_alive(&self) -> bool {
        self.runner.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

/// Per-agent entry of the attack report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatusReport {
    /// The configured agent name.
    pub agent_name: String,
    /// Scheduled start instant.
    pub start_time: String,
    /// Scheduled end instant, or `"NaN"` for untimed agents.
    pub end_time: String,
    /// Final status of the agent.
    pub status: String,
}

/// The structured record emitted after an attack run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackReport {
    /// The plan identifier.
    pub id: String,
    /// The host the attack ran on.
    pub host: String,
    /// Start of the attack window.
    pub start_time: String,
    /// Expected end of the attack window.
    pub expected_end_time: String,
    /// The execution mode of the attack.
    pub mode: String,
    /// Per-agent outcomes, in declared order.
    pub agents: Vec<AgentStatusReport>,
}

impl AttackReport {
    /// Serialize the report as YAML, the default on-disk encoding.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Serialize the report as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a report back from YAML.
    pub fn from_yaml(document: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(document)
    }

    /// Parse a report back from JSON.
    pub fn from_json(document: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(document)
    }
}

/// The per-host scheduler that runs all agents of one plan.
pub struct Coordinator {
    test_plan: TestPlan,
    configured_agents: Vec<ConfiguredAgent>,
    attack_start_time: Option<DateTime<Utc>>,
    attack_end_time: Option<DateTime<Utc>>,
    exit_code: i32,
    hooks: HookRegistry<CoordinatorEvent>,
}

impl Coordinator {
    /// A coordinator for one plan. The plan is consumed read-only and lives
    /// for exactly this run.
    pub fn new(test_plan: TestPlan) -> Self {
        Self {
            test_plan,
            configured_agents: Vec::new(),
            attack_start_time: None,
            attack_end_time: None,
            exit_code: 0,
            hooks: HookRegistry::new(COORDINATOR_EVENTS),
        }
    }

    /// Register a hook listener for one of [`COORDINATOR_EVENTS`].
    pub fn register_hook(
        &mut self,
        event_name: &str,
        listener: Arc<dyn EventListener<CoordinatorEvent>>,
    ) -> Result<(), HookError> {
        self.hooks.register_hook(event_name, listener)
    }

    /// Register a closure as a hook listener.
    pub fn register_fn<F>(&mut self, event_name: &str, hook: F) -> Result<(), HookError>
    where
        F: Fn(&CoordinatorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.register_fn(event_name, hook)
    }

    /// Build and time-plan every agent of the plan, in declared order.
    ///
    /// Schema violations in any agent config surface here, before any agent
    /// is constructed into the schedule.
    pub fn configure_agents_in_plan(&mut self) -> Result<(), CoordinatorError> {
        let agents = registry::build_agents(&self.test_plan.attack.agents)?;
        self.configure_prepared_agents(agents);
        Ok(())
    }

    /// Time-plan a set of pre-built agents.
    ///
    /// The base reference time is now for the first agent; for SEQUENTIAL
    /// plans each subsequent agent chains on the previous agent's end time.
    pub fn configure_prepared_agents(&mut self, agents: Vec<Arc<dyn Agent>>) {
        use ychaos_core::testplan::AttackMode;

        for agent in agents {
            let mut reference = Utc::now();
            if self.test_plan.attack.mode == AttackMode::Sequential {
                if let Some(previous) = self.configured_agents.last() {
                    reference = previous.end_time;
                }
            }
            let start_time =
                reference + chrono::Duration::seconds(agent.base().start_delay as i64);
            let end_time = start_time
                + chrono::Duration::seconds(
                    agent.duration().unwrap_or(DEFAULT_DURATION) as i64
                );
            self.configured_agents
                .push(ConfiguredAgent::new(agent, start_time, end_time));
        }

        self.attack_start_time = self
            .configured_agents
            .iter()
            .map(|agent| agent.start_time)
            .min();
        self.attack_end_time = self
            .configured_agents
            .iter()
            .map(|agent| agent.end_time)
            .max();
    }

    /// The configured agents, in declared order.
    pub fn configured_agents(&self) -> &[ConfiguredAgent] {
        &self.configured_agents
    }

    /// Start of the overall attack window.
    pub fn attack_start_time(&self) -> Option<DateTime<Utc>> {
        self.attack_start_time
    }

    /// End of the overall attack window.
    pub fn attack_end_time(&self) -> Option<DateTime<Utc>> {
        self.attack_end_time
    }

    /// The exit status of the attack: 0 on success, 1 otherwise.
    pub fn get_exit_status(&self) -> i32 {
        self.exit_code
    }

    /// Scan for the next agent eligible to run and set it up.
    ///
    /// Eligible means: in INIT with its start time in the past. A setup
    /// failure captures the error, fails the run and ends the scan.
    async fn get_next_agent_for_attack(&mut self) -> Option<usize> {
        let now = Utc::now();
        for index in 0..self.configured_agents.len() {
            let configured = &self.configured_agents[index];
            let eligible = configured.agent.lifecycle().current_state() == AgentState::Init
                && now > configured.start_time;
            if !eligible {
                continue;
            }
            match setup_guarded(configured.agent.as_ref()).await {
                Ok(()) => return Some(index),
                Err(error) => {
                    let lifecycle = configured.agent.lifecycle();
                    lifecycle.record_error(error);
                    lifecycle.advance_state(AgentState::Error);
                    self.exit_code = 1;
                    return None;
                }
            }
        }
        None
    }

    /// Scan for the next agent eligible for teardown: RUNNING, past its end
    /// time, with no teardown worker yet.
    fn get_next_agent_for_teardown(&self) -> Option<usize> {
        let now = Utc::now();
        self.configured_agents.iter().position(|configured| {
            configured.agent.lifecycle().current_state() == AgentState::Running
                && now > configured.end_time
                && configured.teardown.is_none()
        })
    }

    /// Whether any agent is in ERROR or has queued exceptions. A hit marks
    /// the agent's scratchpad and pins its state to ERROR.
    fn check_for_failed_agents(&mut self) -> bool {
        for configured in &self.configured_agents {
            let lifecycle = configured.agent.lifecycle();
            if lifecycle.current_state() == AgentState::Error || lifecycle.has_errors() {
                lifecycle.advance_state(AgentState::Error);
                lifecycle.with_preserved(|preserved| preserved.has_error = true);
                return true;
            }
        }
        false
    }

    /// Perform the attack as configured in the plan.
    ///
    /// Runs the 1 Hz scheduler loop over the attack window, then the
    /// synchronous teardown barrier. Returns the exit status.
    pub async fn start_attack(&mut self) -> Result<i32, CoordinatorError> {
        let attack_end_time = self.attack_end_time.ok_or(CoordinatorError::NotConfigured)?;

        info!(plan = %self.test_plan.id, "attack started");
        self.hooks.emit(&CoordinatorEvent::AttackStart)?;

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while Utc::now() <= attack_end_time {
            if let Some(index) = self.get_next_agent_for_attack().await {
                let configured = &mut self.configured_agents[index];
                configured.runner = Some(start_async(Arc::clone(&configured.agent)));
                let agent = configured.agent.name().to_string();
                self.hooks.emit(&CoordinatorEvent::AgentStart { agent })?;
            }

            if let Some(index) = self.get_next_agent_for_teardown() {
                let configured = &mut self.configured_agents[index];
                configured.teardown = Some(teardown_async(Arc::clone(&configured.agent)));
                let agent = configured.agent.name().to_string();
                self.hooks.emit(&CoordinatorEvent::AgentTeardown { agent })?;
            }

            tick.tick().await;

            if self.check_for_failed_agents() {
                self.exit_code = 1;
                break;
            }
        }

        self.stop_all_running_agents_in_sync().await?;

        if self.exit_code == 0 {
            info!(plan = %self.test_plan.id, "attack completed");
        } else {
            info!(plan = %self.test_plan.id, "attack failed");
        }
        self.hooks.emit(&CoordinatorEvent::AttackCompleted)?;
        Ok(self.exit_code)
    }

    /// The synchronous barrier: classify every agent, guarantee a teardown
    /// worker for everything that needs one, and join each with the
    /// framework timeout.
    async fn stop_all_running_agents_in_sync(&mut self) -> Result<(), CoordinatorError> {
        for index in 0..self.configured_agents.len() {
            let run_failed = self.exit_code != 0;
            let configured = &mut self.configured_agents[index];
            let agent = Arc::clone(&configured.agent);
            let lifecycle = agent.lifecycle();
            let agent_name = agent.name().to_string();

            match lifecycle.current_state() {
                AgentState::Setup | AgentState::Init => {
                    lifecycle.advance_state(AgentState::Skipped);
                }
                AgentState::Error => {
                    lifecycle.with_preserved(|preserved| preserved.has_error = true);
                    self.exit_code = 1;
                }
                _ => {
                    if configured.runner_alive() && run_failed {
                        lifecycle.with_preserved(|preserved| preserved.is_aborted = true);
                        lifecycle.advance_state(AgentState::Aborted);
                    }
                }
            }

            let state = lifecycle.current_state();
            if state != AgentState::Done && state != AgentState::Skipped {
                let teardown = match configured.teardown.take() {
                    Some(handle) => handle,
                    None => {
                        let handle = teardown_async(Arc::clone(&agent));
                        self.hooks.emit(&CoordinatorEvent::AgentTeardown {
                            agent: agent_name.clone(),
                        })?;
                        handle
                    }
                };

                let joined =
                    tokio::time::timeout(Duration::from_secs(TEARDOWN_TIMEOUT), teardown).await;
                if joined.is_err() {
                    lifecycle.record_error(AgentError::TeardownTimeout(TEARDOWN_TIMEOUT).into());
                }
                if joined.is_err()
                    || lifecycle.has_errors()
                    || lifecycle.current_state() == AgentState::Error
                {
                    self.exit_code = 1;
                    lifecycle.advance_state(AgentState::Error);
                    lifecycle.with_preserved(|preserved| preserved.has_error = true);
                }
            }

            self.hooks.emit(&CoordinatorEvent::AgentStop {
                agent: agent_name,
            })?;

            // Drain the exception queue into the agent's durable error list
            // so report generation still sees everything.
            lifecycle.collect_errors();
        }
        Ok(())
    }

    /// Every error captured during the attack, across all agents.
    pub fn get_all_exceptions(&self) -> Vec<String> {
        self.configured_agents
            .iter()
            .flat_map(|configured| configured.agent.lifecycle().collect_errors())
            .collect()
    }

    /// Generate the attack report from the configured agents.
    pub fn generate_attack_report(&mut self) -> AttackReport {
        let host = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());

        let mut agents = Vec::with_capacity(self.configured_agents.len());
        for configured in &self.configured_agents {
            let lifecycle = configured.agent.lifecycle();
            let end_time = if configured.agent.duration().is_some() {
                configured.end_time.to_rfc3339()
            } else {
                UNTIMED_END_TIME.to_string()
            };
            let (has_error, is_aborted) =
                lifecycle.with_preserved(|preserved| (preserved.has_error, preserved.is_aborted));
            let status = if has_error {
                self.exit_code = 1;
                AgentState::Error.as_str().to_string()
            } else if is_aborted {
                AgentState::Aborted.as_str().to_string()
            } else {
                lifecycle.current_state().as_str().to_string()
            };
            agents.push(AgentStatusReport {
                agent_name: configured.agent.name().to_string(),
                start_time: configured.start_time.to_rfc3339(),
                end_time,
                status,
            });
        }

        AttackReport {
            id: self.test_plan.id.to_string(),
            host,
            start_time: self
                .attack_start_time
                .map(|instant| instant.to_rfc3339())
                .unwrap_or_default(),
            expected_end_time: self
                .attack_end_time
                .map(|instant| instant.to_rfc3339())
                .unwrap_or_default(),
            mode: self.test_plan.attack.mode.as_str().to_string(),
            agents,
        }
    }
}
