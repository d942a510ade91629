//! Ping disable agent: makes the host ignore ICMP echo requests by flipping
//! the `icmp_echo_ignore_all` sysctl, and restores the prior value at
//! teardown.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::agent::{
    default_duration, Agent, AgentError, AgentLifecycle, AgentMonitoringDataPoint,
    BaseAgentFields,
};

use super::sysctl::SysCtl;

const SYSCTL_VAR: &str = "net.ipv4.icmp_echo_ignore_all";
const ALREADY_DISABLED_FLAG: &str = "ping_already_disabled";

/// Configuration of the ping disable agent. Requires root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingDisableConfig {
    /// Shared agent fields.
    #[serde(flatten)]
    pub base: BaseAgentFields,
    /// The duration for which this agent should run.
    #[serde(default = "default_duration")]
    pub duration: u64,
}

/// The ping disable agent.
pub struct PingDisable {
    config: PingDisableConfig,
    lifecycle: AgentLifecycle,
}

impl PingDisable {
    /// Build the agent from its validated config.
    pub fn new(mut config: PingDisableConfig) -> Self {
        config.base.ensure_named("ping_disable");
        Self {
            config,
            lifecycle: AgentLifecycle::new(),
        }
    }

    fn already_disabled(&self) -> bool {
        self.lifecycle
            .flag(ALREADY_DISABLED_FLAG)
            .and_then(|value| value.as_bool())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Agent for PingDisable {
    fn base(&self) -> &BaseAgentFields {
        &self.config.base
    }

    fn duration(&self) -> Option<u64> {
        Some(self.config.duration)
    }

    fn lifecycle(&self) -> &AgentLifecycle {
        &self.lifecycle
    }

    /// Remembers whether ICMP ignore was already on before the attack, so
    /// teardown never reverts a state the agent did not create.
    async fn setup(&self) -> anyhow::Result<()> {
        let current = SysCtl::get(SYSCTL_VAR)?;
        self.lifecycle
            .set_flag(ALREADY_DISABLED_FLAG, current == "1");
        Ok(())
    }

    async fn run(&self) -> anyhow::Result<()> {
        if self.already_disabled() {
            warn!(
                agent = self.name(),
                "ICMP ignore is already turned on, running this agent is a no-operation"
            );
            return Ok(());
        }
        if !SysCtl::set(SYSCTL_VAR, "1").await? {
            return Err(AgentError::Failed(format!("unable to set {SYSCTL_VAR}=1")).into());
        }
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        if !self.already_disabled() {
            if !SysCtl::set(SYSCTL_VAR, "0").await? {
                return Err(AgentError::Failed(format!("unable to restore {SYSCTL_VAR}=0")).into());
            }
        }
        Ok(())
    }

    async fn monitor(&self) {
        let mut data = BTreeMap::new();
        if let Ok(value) = SysCtl::get(SYSCTL_VAR) {
            data.insert("icmp_echo_ignore_all".to_string(), serde_json::json!(value));
        }
        self.lifecycle
            .push_status(AgentMonitoringDataPoint::now(self.lifecycle.current_state(), data));
    }
}
