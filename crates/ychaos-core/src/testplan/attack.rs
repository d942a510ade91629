//! The attack half of a test plan: target descriptor, execution mode and the
//! ordered agent list.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::secrets::SecretValue;
use crate::{PlanError, Result};

use super::hosts::{expand_host_pattern, Fqdn};

/// Login parameters used by a remote driver to reach machine targets.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SshConfig {
    /// Login user. Empty means the invoking user.
    #[serde(default)]
    pub user: String,
    /// Private key file used to log into the hosts.
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    /// Login password, inline or as a secret reference.
    #[serde(default)]
    pub password: Option<SecretValue>,
}

/// Target descriptor for running the attack in this very process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SelfTargetDefinition {
    /// Directory where the attack report is stored.
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
}

/// Target descriptor for attacking this machine over loopback SSH.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostTargetDefinition {
    /// SSH parameters for the loopback connection.
    #[serde(default)]
    pub ssh_config: SshConfig,
    /// Directory where the fetched workspace archive is stored.
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
}

/// Target descriptor for a set of remote machines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineTargetDefinition {
    /// Percentage of the effective hosts that is actually attacked.
    pub blast_radius: u8,
    /// SSH parameters used to log into the hosts.
    #[serde(default)]
    pub ssh_config: SshConfig,
    /// Literal target hostnames. Must be valid FQDNs.
    #[serde(default)]
    pub hostnames: Vec<Fqdn>,
    /// Host patterns with a single numeric range, e.g. `web[00-10].example.com`.
    #[serde(default)]
    pub hostpatterns: Vec<String>,
    /// Files containing newline-separated hostnames. Read at plan use, not at
    /// plan validation.
    #[serde(default)]
    pub hostfiles: Vec<PathBuf>,
    /// Hosts always excluded from the attack.
    #[serde(default)]
    pub exclude: Vec<Fqdn>,
    /// Directory where fetched workspace archives are stored.
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
}

fn default_report_dir() -> PathBuf {
    PathBuf::from(".")
}

impl MachineTargetDefinition {
    /// Expand every host pattern into concrete hostnames.
    pub fn expand_hostpatterns(&self) -> Result<Vec<Fqdn>> {
        let mut expanded = Vec::new();
        for pattern in &self.hostpatterns {
            expanded.extend(expand_host_pattern(pattern)?);
        }
        Ok(expanded)
    }

    /// Read every host file into hostnames, validating each entry.
    pub fn expand_hostfiles(&self) -> Result<Vec<Fqdn>> {
        let mut hosts = Vec::new();
        for file in &self.hostfiles {
            for line in std::fs::read_to_string(file)?.lines() {
                let line = line.trim();
                if !line.is_empty() {
                    hosts.push(Fqdn::new(line)?);
                }
            }
        }
        Ok(hosts)
    }

    /// The effective host set: literals, expanded patterns and file contents,
    /// minus the exclusion set. Sorted, deduplicated.
    pub fn effective_hosts(&self) -> Result<Vec<Fqdn>> {
        let mut hosts: BTreeSet<Fqdn> = self.hostnames.iter().cloned().collect();
        hosts.extend(self.expand_hostpatterns()?);
        hosts.extend(self.expand_hostfiles()?);
        for excluded in &self.exclude {
            hosts.remove(excluded);
        }
        Ok(hosts.into_iter().collect())
    }

    fn validate(&self) -> Result<()> {
        if self.blast_radius > 100 {
            return Err(PlanError::Invalid(format!(
                "blast_radius must be within [0, 100], got {}",
                self.blast_radius
            )));
        }
        for pattern in &self.hostpatterns {
            expand_host_pattern(pattern)?;
        }
        Ok(())
    }
}

/// The tagged target variant of an attack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "target_type", content = "target_config", rename_all = "snake_case")]
pub enum TargetConfig {
    /// Run the agents within the process that invoked the engine.
    #[serde(rename = "self")]
    SelfTarget(SelfTargetDefinition),
    /// Run the agents on this machine, reached over loopback.
    Host(HostTargetDefinition),
    /// Run the agents on a blast-radius-sized sample of remote machines.
    Machine(MachineTargetDefinition),
}

impl TargetConfig {
    /// The directory configured for reports on this target.
    pub fn report_dir(&self) -> &PathBuf {
        match self {
            Self::SelfTarget(target) => &target.report_dir,
            Self::Host(target) => &target.report_dir,
            Self::Machine(target) => &target.report_dir,
        }
    }

    /// The wire tag of this variant.
    pub fn target_type(&self) -> &'static str {
        match self {
            Self::SelfTarget(_) => "self",
            Self::Host(_) => "host",
            Self::Machine(_) => "machine",
        }
    }
}

/// Execution mode for the configured agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttackMode {
    /// All agents share one attack window, offset only by their start delays.
    Concurrent,
    /// Each agent starts after the previous agent's window has ended.
    #[default]
    Sequential,
}

impl AttackMode {
    /// The wire name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concurrent => "concurrent",
            Self::Sequential => "sequential",
        }
    }
}

/// The closed set of built-in agent kinds.
///
/// Each tag maps to a config schema and an agent constructor in the agent
/// registry; `contrib` is the single open variant, loading a user-supplied
/// agent from a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Does nothing; completes immediately.
    NoOp,
    /// Does nothing for `duration` seconds.
    NoOpTimed,
    /// Burns CPU on a percentage of the cores.
    CpuBurn,
    /// Fills a percentage of the free space of a partition.
    DiskFill,
    /// Blocks traffic on ports/endpoints via iptables rules.
    IptablesBlock,
    /// Blocks DNS traffic via iptables rules.
    DnsBlock,
    /// Blocks outbound traffic to hostnames via the hosts file.
    TrafficBlock,
    /// Disables ICMP echo responses via sysctl.
    PingDisable,
    /// Runs an arbitrary shell command.
    Shell,
    /// Validates the TLS certificates served by remote endpoints.
    ServerCertValidation,
    /// Validates local certificate files for expiry.
    CertFileValidation,
    /// A user-supplied agent side-loaded from a path.
    Contrib,
}

impl AgentType {
    /// The wire tag of this agent kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoOp => "no_op",
            Self::NoOpTimed => "no_op_timed",
            Self::CpuBurn => "cpu_burn",
            Self::DiskFill => "disk_fill",
            Self::IptablesBlock => "iptables_block",
            Self::DnsBlock => "dns_block",
            Self::TrafficBlock => "traffic_block",
            Self::PingDisable => "ping_disable",
            Self::Shell => "shell",
            Self::ServerCertValidation => "server_cert_validation",
            Self::CertFileValidation => "cert_file_validation",
            Self::Contrib => "contrib",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One agent entry of the attack: a type tag plus its config subtree.
///
/// The config is kept as raw document data here; the agent registry validates
/// it against the tag's schema before any agent is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionConfig {
    /// The agent kind to execute on the target.
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    /// The agent configuration for that kind.
    #[serde(default = "empty_config")]
    pub config: serde_json::Value,
}

fn empty_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// The attack: target, mode and ordered agent list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackConfig {
    /// Where the agents run.
    #[serde(flatten)]
    pub target: TargetConfig,
    /// Execution mode for the agents.
    #[serde(default)]
    pub mode: AttackMode,
    /// Agents to be executed on the target, in declared order.
    pub agents: Vec<AgentExecutionConfig>,
}

impl AttackConfig {
    /// Enforce the attack invariants the schema cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(PlanError::Invalid("attack needs at least one agent".into()));
        }
        if let TargetConfig::Machine(machine) = &self.target {
            machine.validate()?;
        }
        Ok(())
    }
}
