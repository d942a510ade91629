//! The agent registry: maps each agent type tag of the plan to a config
//! schema and a constructor.
//!
//! Configs arrive as raw document subtrees; deserializing into the typed
//! config plus its `validate()` hook is the schema check, and it runs here so
//! that violations surface before any agent is constructed.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use ychaos_core::testplan::{AgentExecutionConfig, AgentType};
use ychaos_core::PlanError;

use crate::agent::{Agent, BaseAgentFields};
use crate::agents::contrib::{ContribAgent, ContribAgentConfig};
use crate::agents::network::iptables::{DnsBlock, DnsBlockConfig, IptablesBlock, IptablesBlockConfig};
use crate::agents::network::traffic::{TrafficBlock, TrafficBlockConfig};
use crate::agents::special::{NoOpAgent, NoOpAgentConfig, NoOpTimedAgent, NoOpTimedAgentConfig};
use crate::agents::system::cpu::{CpuBurn, CpuBurnConfig};
use crate::agents::system::disk_fill::{DiskFill, DiskFillConfig};
use crate::agents::system::ping::{PingDisable, PingDisableConfig};
use crate::agents::system::shell::{Shell, ShellConfig};
use crate::agents::validation::{
    CertFileValidation, CertFileValidationConfig, ServerCertValidation,
    ServerCertValidationConfig,
};

fn typed<T: DeserializeOwned>(entry: &AgentExecutionConfig) -> Result<T, PlanError> {
    serde_json::from_value(entry.config.clone()).map_err(|error| PlanError::AgentConfig {
        agent: entry.agent_type.to_string(),
        reason: error.to_string(),
    })
}

/// Agents that attack as root unless the plan explicitly opts out.
fn sudo_unless_configured(entry: &AgentExecutionConfig, base: &mut BaseAgentFields) {
    let configured = entry
        .config
        .as_object()
        .is_some_and(|config| config.contains_key("is_sudo"));
    if !configured {
        base.is_sudo = true;
    }
}

/// Build one agent from its plan entry.
pub fn build_agent(entry: &AgentExecutionConfig) -> Result<Arc<dyn Agent>, PlanError> {
    let agent: Arc<dyn Agent> = match entry.agent_type {
        AgentType::NoOp => Arc::new(NoOpAgent::new(typed::<NoOpAgentConfig>(entry)?)),
        AgentType::NoOpTimed => {
            Arc::new(NoOpTimedAgent::new(typed::<NoOpTimedAgentConfig>(entry)?))
        }
        AgentType::CpuBurn => {
            let config = typed::<CpuBurnConfig>(entry)?;
            config.validate()?;
            Arc::new(CpuBurn::new(config))
        }
        AgentType::DiskFill => {
            let config = typed::<DiskFillConfig>(entry)?;
            config.validate()?;
            Arc::new(DiskFill::new(config))
        }
        AgentType::Shell => Arc::new(Shell::new(typed::<ShellConfig>(entry)?)),
        AgentType::PingDisable => {
            let mut config = typed::<PingDisableConfig>(entry)?;
            sudo_unless_configured(entry, &mut config.base);
            Arc::new(PingDisable::new(config))
        }
        AgentType::IptablesBlock => {
            let mut config = typed::<IptablesBlockConfig>(entry)?;
            config.validate()?;
            sudo_unless_configured(entry, &mut config.base);
            Arc::new(IptablesBlock::new(config))
        }
        AgentType::DnsBlock => {
            let mut config = typed::<DnsBlockConfig>(entry)?;
            config.validate()?;
            sudo_unless_configured(entry, &mut config.base);
            Arc::new(DnsBlock::new(config))
        }
        AgentType::TrafficBlock => {
            let mut config = typed::<TrafficBlockConfig>(entry)?;
            sudo_unless_configured(entry, &mut config.base);
            Arc::new(TrafficBlock::new(config)?)
        }
        AgentType::ServerCertValidation => {
            let config = typed::<ServerCertValidationConfig>(entry)?;
            config.validate()?;
            Arc::new(ServerCertValidation::new(config))
        }
        AgentType::CertFileValidation => {
            let config = typed::<CertFileValidationConfig>(entry)?;
            config.validate()?;
            Arc::new(CertFileValidation::new(config))
        }
        AgentType::Contrib => {
            Arc::new(ContribAgent::load(typed::<ContribAgentConfig>(entry)?)?)
        }
    };
    Ok(agent)
}

/// Build every agent of a plan, in declared order.
pub fn build_agents(
    entries: &[AgentExecutionConfig],
) -> Result<Vec<Arc<dyn Agent>>, PlanError> {
    entries.iter().map(build_agent).collect()
}
