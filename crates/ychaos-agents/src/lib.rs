//! YChaos Agents
//!
//! The attack half of the YChaos resilience testing framework: the agent
//! lifecycle framework, the built-in failure injectors, the agent registry
//! and the per-host coordinator that schedules one test plan end to end.

pub mod agent;
pub mod agents;
pub mod coordinator;
pub mod registry;

pub use agent::{
    is_runnable, setup_guarded, start, start_async, teardown_async, Agent, AgentError,
    AgentLifecycle, AgentMonitoringDataPoint, AgentState, BaseAgentFields,
};
pub use coordinator::{
    AttackReport, ConfiguredAgent, Coordinator, CoordinatorError, CoordinatorEvent,
    COORDINATOR_EVENTS, DEFAULT_DURATION, TEARDOWN_TIMEOUT,
};
pub use registry::{build_agent, build_agents};
