//! Traffic block agent: points hostnames at loopback through the hosts file,
//! restoring the original file from a read-only backup at teardown.

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::agent::{default_duration, Agent, AgentLifecycle, BaseAgentFields};
use ychaos_core::PlanError;

const LOCALHOST: &str = "127.0.0.1";

/// Configuration of the traffic block agent. Requires root to edit the
/// system hosts file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficBlockConfig {
    /// Shared agent fields.
    #[serde(flatten)]
    pub base: BaseAgentFields,
    /// The duration for which this agent should run.
    #[serde(default = "default_duration")]
    pub duration: u64,
    /// The hosts file to edit.
    #[serde(default = "default_hostsfile")]
    pub hostsfile: PathBuf,
    /// Where to back up the hosts file. A temporary file by default.
    #[serde(default)]
    pub backup_hostsfile: Option<PathBuf>,
    /// Destination hostnames to block.
    #[serde(default)]
    pub hosts: Vec<String>,
}

fn default_hostsfile() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

/// The traffic block agent.
pub struct TrafficBlock {
    config: TrafficBlockConfig,
    lifecycle: AgentLifecycle,
    backup_path: PathBuf,
    original_mode: Mutex<Option<u32>>,
}

impl TrafficBlock {
    /// Build the agent from its validated config. Allocates the backup file
    /// path when none was configured.
    pub fn new(mut config: TrafficBlockConfig) -> Result<Self, PlanError> {
        config.base.ensure_named("traffic_block");
        let backup_path = match &config.backup_hostsfile {
            Some(path) => path.clone(),
            None => tempfile::Builder::new()
                .prefix("ychaos-hosts-")
                .suffix(".bak")
                .tempfile()
                .map_err(|error| PlanError::AgentConfig {
                    agent: "traffic_block".into(),
                    reason: format!("unable to allocate backup file: {error}"),
                })?
                .into_temp_path()
                .keep()
                .map_err(|error| PlanError::AgentConfig {
                    agent: "traffic_block".into(),
                    reason: format!("unable to persist backup file: {error}"),
                })?,
        };
        Ok(Self {
            config,
            lifecycle: AgentLifecycle::new(),
            backup_path,
            original_mode: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Agent for TrafficBlock {
    fn base(&self) -> &BaseAgentFields {
        &self.config.base
    }

    fn duration(&self) -> Option<u64> {
        Some(self.config.duration)
    }

    fn lifecycle(&self) -> &AgentLifecycle {
        &self.lifecycle
    }

    /// Copies the hosts file aside and makes the backup read-only. That
    /// protects it from accidental edits until teardown restores it.
    async fn setup(&self) -> anyhow::Result<()> {
        tokio::fs::copy(&self.config.hostsfile, &self.backup_path).await?;

        let metadata = tokio::fs::metadata(&self.backup_path).await?;
        *self.original_mode.lock() = Some(metadata.permissions().mode());
        tokio::fs::set_permissions(&self.backup_path, Permissions::from_mode(0o444)).await?;
        Ok(())
    }

    async fn run(&self) -> anyhow::Result<()> {
        let mut entries = String::from("\n");
        for host in &self.config.hosts {
            entries.push_str(&format!("{LOCALHOST}\t{host}\n"));
        }
        let current = tokio::fs::read_to_string(&self.config.hostsfile).await?;
        tokio::fs::write(&self.config.hostsfile, current + &entries).await?;
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        let mode = *self.original_mode.lock();
        if let Some(mode) = mode {
            tokio::fs::set_permissions(&self.backup_path, Permissions::from_mode(mode)).await?;
        }
        tokio::fs::copy(&self.backup_path, &self.config.hostsfile).await?;
        tokio::fs::remove_file(&self.backup_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{setup_guarded, start_async, teardown_async, AgentState};
    use std::sync::Arc;

    fn agent_for(hostsfile: &std::path::Path, hosts: &[&str]) -> Arc<dyn Agent> {
        let config: TrafficBlockConfig = serde_json::from_value(serde_json::json!({
            "duration": 1,
            "hostsfile": hostsfile,
            "hosts": hosts,
        }))
        .expect("config");
        Arc::new(TrafficBlock::new(config).expect("agent"))
    }

    #[tokio::test]
    async fn blocked_hosts_are_appended_and_restored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let hostsfile = dir.path().join("hosts");
        std::fs::write(&hostsfile, "127.0.0.1\tlocalhost\n").expect("seed");

        let agent = agent_for(&hostsfile, &["blocked.example.com"]);
        setup_guarded(agent.as_ref()).await.expect("setup");
        start_async(Arc::clone(&agent)).await.expect("runner");

        let during = std::fs::read_to_string(&hostsfile).expect("read");
        assert!(during.contains("127.0.0.1\tblocked.example.com"));

        teardown_async(Arc::clone(&agent)).await.expect("stopper");
        assert_eq!(agent.lifecycle().current_state(), AgentState::Done);

        let after = std::fs::read_to_string(&hostsfile).expect("read");
        assert_eq!(after, "127.0.0.1\tlocalhost\n");
    }

    #[tokio::test]
    async fn restore_happens_even_when_run_failed_midway() {
        let dir = tempfile::tempdir().expect("tempdir");
        let hostsfile = dir.path().join("hosts");
        std::fs::write(&hostsfile, "original\n").expect("seed");

        let agent = agent_for(&hostsfile, &["a.example.com"]);
        setup_guarded(agent.as_ref()).await.expect("setup");
        // Simulate a failed run: the hosts file was half-mangled by hand.
        std::fs::write(&hostsfile, "mangled\n").expect("mangle");

        teardown_async(Arc::clone(&agent)).await.expect("stopper");
        let after = std::fs::read_to_string(&hostsfile).expect("read");
        assert_eq!(after, "original\n");
    }
}
