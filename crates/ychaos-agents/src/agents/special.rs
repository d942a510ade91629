//! Agents that do nothing. Useful as placeholders and for exercising the
//! scheduler without touching the host.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::{default_duration, Agent, AgentLifecycle, BaseAgentFields};

/// Configuration of the no-op agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoOpAgentConfig {
    /// Shared agent fields.
    #[serde(flatten)]
    pub base: BaseAgentFields,
}

/// An agent that does nothing.
pub struct NoOpAgent {
    config: NoOpAgentConfig,
    lifecycle: AgentLifecycle,
}

impl NoOpAgent {
    /// Build the agent from its validated config.
    pub fn new(mut config: NoOpAgentConfig) -> Self {
        config.base.ensure_named("no_op");
        Self {
            config,
            lifecycle: AgentLifecycle::new(),
        }
    }
}

#[async_trait]
impl Agent for NoOpAgent {
    fn base(&self) -> &BaseAgentFields {
        &self.config.base
    }

    fn lifecycle(&self) -> &AgentLifecycle {
        &self.lifecycle
    }

    async fn setup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Configuration of the timed no-op agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoOpTimedAgentConfig {
    /// Shared agent fields.
    #[serde(flatten)]
    pub base: BaseAgentFields,
    /// The duration for which this agent should run.
    #[serde(default = "default_duration")]
    pub duration: u64,
}

/// A time-constrained agent that does nothing for `duration` seconds.
pub struct NoOpTimedAgent {
    config: NoOpTimedAgentConfig,
    lifecycle: AgentLifecycle,
}

impl NoOpTimedAgent {
    /// Build the agent from its validated config.
    pub fn new(mut config: NoOpTimedAgentConfig) -> Self {
        config.base.ensure_named("no_op_timed");
        Self {
            config,
            lifecycle: AgentLifecycle::new(),
        }
    }
}

#[async_trait]
impl Agent for NoOpTimedAgent {
    fn base(&self) -> &BaseAgentFields {
        &self.config.base
    }

    fn duration(&self) -> Option<u64> {
        Some(self.config.duration)
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
            _ = tokio::time::sleep(std::time::Duration::from_secs(self.config.duration)) => {}
            _ = cancel.cancelled() => {}
        }
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
