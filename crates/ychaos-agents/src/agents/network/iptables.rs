//! Packet filter agents: block ports or endpoints by inserting iptables DROP
//! rules during the run and deleting them at teardown. Both agents require
//! root.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::{
    default_duration, Agent, AgentError, AgentLifecycle, AgentState, BaseAgentFields,
};
use ychaos_core::PlanError;

const DNS_PORT: u16 = 53;

#[derive(Clone, Copy)]
enum Chain {
    Input,
    Output,
}

impl Chain {
    fn as_str(self) -> &'static str {
        match self {
            Self::Input => "INPUT",
            Self::Output => "OUTPUT",
        }
    }
}

#[derive(Clone, Copy)]
enum RuleOperation {
    Insert,
    Delete,
}

impl RuleOperation {
    fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "-I",
            Self::Delete => "-D",
        }
    }
}

/// One DROP rule: protocol plus an optional destination port and endpoint.
#[derive(Clone)]
struct Rule {
    chain: Chain,
    protocol: &'static str,
    port: Option<u16>,
    endpoint: Option<String>,
}

fn iptables_argv(operation: RuleOperation, rule: &Rule, wait: u64) -> Vec<String> {
    let mut argv: Vec<String> = [
        "iptables",
        operation.as_str(),
        rule.chain.as_str(),
        "-p",
        rule.protocol,
        "-j",
        "DROP",
        "-w",
    ]
    .into_iter()
    .map(str::to_string)
    .collect();
    argv.push(wait.to_string());
    if let Some(port) = rule.port {
        argv.push("--dport".to_string());
        argv.push(port.to_string());
    }
    if let Some(endpoint) = &rule.endpoint {
        argv.push("-d".to_string());
        argv.push(endpoint.clone());
    }
    argv
}

async fn run_iptables(operation: RuleOperation, rule: &Rule, wait: u64) -> anyhow::Result<bool> {
    let argv = iptables_argv(operation, rule, wait);
    let mut command = if nix::unistd::geteuid().is_root() {
        tokio::process::Command::new(&argv[0])
    } else {
        let mut sudo = tokio::process::Command::new("sudo");
        sudo.arg(&argv[0]);
        sudo
    };
    let output = command.args(&argv[1..]).output().await?;
    Ok(output.status.success())
}

/// Configuration of the port/endpoint blocking agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IptablesBlockConfig {
    /// Shared agent fields.
    #[serde(flatten)]
    pub base: BaseAgentFields,
    /// The duration for which this agent should run.
    #[serde(default = "default_duration")]
    pub duration: u64,
    /// Incoming ports to block.
    #[serde(default)]
    pub incoming_ports: Vec<u16>,
    /// Destination ports to block.
    #[serde(default)]
    pub destination_ports: Vec<u16>,
    /// Incoming endpoints (addresses or networks) to block.
    #[serde(default)]
    pub incoming_endpoints: Vec<String>,
    /// Outgoing endpoints (addresses or networks) to block.
    #[serde(default)]
    pub outgoing_endpoints: Vec<String>,
    /// Seconds iptables waits for its exclusive lock (`-w`).
    #[serde(default = "default_iptables_wait")]
    pub iptables_wait: u64,
}

fn default_iptables_wait() -> u64 {
    3
}

impl IptablesBlockConfig {
    fn rules(&self) -> Vec<Rule> {
        let mut rules = Vec::new();
        for port in &self.incoming_ports {
            rules.push(Rule {
                chain: Chain::Input,
                protocol: "tcp",
                port: Some(*port),
                endpoint: None,
            });
        }
        for port in &self.destination_ports {
            rules.push(Rule {
                chain: Chain::Output,
                protocol: "tcp",
                port: Some(*port),
                endpoint: None,
            });
        }
        for endpoint in &self.incoming_endpoints {
            rules.push(Rule {
                chain: Chain::Input,
                protocol: "tcp",
                port: None,
                endpoint: Some(endpoint.clone()),
            });
        }
        for endpoint in &self.outgoing_endpoints {
            rules.push(Rule {
                chain: Chain::Output,
                protocol: "tcp",
                port: None,
                endpoint: Some(endpoint.clone()),
            });
        }
        rules
    }

    pub(crate) fn validate(&self) -> Result<(), PlanError> {
        if self.iptables_wait == 0 || self.iptables_wait >= 1800 {
            return Err(PlanError::AgentConfig {
                agent: "iptables_block".into(),
                reason: format!(
                    "iptables_wait must be within (0, 1800), got {}",
                    self.iptables_wait
                ),
            });
        }
        Ok(())
    }
}

/// The port/endpoint blocking agent.
pub struct IptablesBlock {
    config: IptablesBlockConfig,
    lifecycle: AgentLifecycle,
}

impl IptablesBlock {
    /// Build the agent from its validated config.
    pub fn new(mut config: IptablesBlockConfig) -> Self {
        config.base.ensure_named("iptables_block");
        Self {
            config,
            lifecycle: AgentLifecycle::new(),
        }
    }
}

#[async_trait]
impl Agent for IptablesBlock {
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
        for rule in self.config.rules() {
            let inserted =
                run_iptables(RuleOperation::Insert, &rule, self.config.iptables_wait).await?;
            if !inserted {
                return Err(AgentError::Failed(format!(
                    "error while adding iptables rule: DROP {:?}/{:?} to {} chain",
                    rule.port,
                    rule.endpoint,
                    rule.chain.as_str()
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Deletes every configured rule; a failed delete is reported only after
    /// all deletes have been attempted.
    async fn teardown(&self) -> anyhow::Result<()> {
        let mut error = false;
        for rule in self.config.rules() {
            let deleted =
                run_iptables(RuleOperation::Delete, &rule, self.config.iptables_wait).await?;
            error = !deleted || error;
        }
        if error {
            return Err(AgentError::Failed("error occurred while removing iptables rule".into()).into());
        }
        Ok(())
    }
}

/// Configuration of the DNS blocking agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsBlockConfig {
    /// Shared agent fields.
    #[serde(flatten)]
    pub base: BaseAgentFields,
    /// The duration for which this agent should run.
    #[serde(default = "default_duration")]
    pub duration: u64,
    /// Seconds iptables waits for its exclusive lock (`-w`).
    #[serde(default = "default_iptables_wait")]
    pub iptables_wait: u64,
}

impl DnsBlockConfig {
    pub(crate) fn validate(&self) -> Result<(), PlanError> {
        if self.iptables_wait == 0 || self.iptables_wait >= 60 {
            return Err(PlanError::AgentConfig {
                agent: "dns_block".into(),
                reason: format!(
                    "iptables_wait must be within (0, 60), got {}",
                    self.iptables_wait
                ),
            });
        }
        Ok(())
    }
}

/// The DNS blocking agent: drops outbound UDP and TCP traffic to port 53.
pub struct DnsBlock {
    config: DnsBlockConfig,
    lifecycle: AgentLifecycle,
}

impl DnsBlock {
    /// Build the agent from its validated config.
    pub fn new(mut config: DnsBlockConfig) -> Self {
        config.base.ensure_named("dns_block");
        Self {
            config,
            lifecycle: AgentLifecycle::new(),
        }
    }

    fn rules() -> [Rule; 2] {
        [
            Rule {
                chain: Chain::Output,
                protocol: "udp",
                port: Some(DNS_PORT),
                endpoint: None,
            },
            Rule {
                chain: Chain::Output,
                protocol: "tcp",
                port: Some(DNS_PORT),
                endpoint: None,
            },
        ]
    }
}

#[async_trait]
impl Agent for DnsBlock {
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
        for rule in Self::rules() {
            let inserted =
                run_iptables(RuleOperation::Insert, &rule, self.config.iptables_wait).await?;
            if !inserted {
                return Err(AgentError::Failed(format!(
                    "error while adding iptables rule: DROP {} port {DNS_PORT} to OUTPUT chain",
                    rule.protocol
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Rules are only deleted when the run actually reached them: teardown
    /// from a pre-RUNNING state has nothing to revert.
    async fn teardown(&self) -> anyhow::Result<()> {
        let reached_run = matches!(
            self.lifecycle.previous_state(),
            Some(AgentState::Running | AgentState::Error | AgentState::Aborted)
        );
        if !reached_run {
            return Ok(());
        }

        let mut error = false;
        for rule in Self::rules() {
            let deleted =
                run_iptables(RuleOperation::Delete, &rule, self.config.iptables_wait).await?;
            error = !deleted || error;
        }
        if error {
            return Err(AgentError::Failed("error occurred while removing iptables rule".into()).into());
        }
        Ok(())
    }
}
