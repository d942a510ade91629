//! Disk fill agent: consumes a percentage of the free space of a partition
//! with filler files, removed again at teardown.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::{
    default_duration, Agent, AgentLifecycle, AgentMonitoringDataPoint, BaseAgentFields,
};
use ychaos_core::PlanError;

/// Configuration of the disk fill attack. `partition_pct` is a percentage of
/// the partition's currently *free* space; the filler files land in a
/// dedicated directory relative to the partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskFillConfig {
    /// Shared agent fields.
    #[serde(flatten)]
    pub base: BaseAgentFields,
    /// The duration for which this agent should run.
    #[serde(default = "default_duration")]
    pub duration: u64,
    /// The directory or partition to fill.
    #[serde(default = "default_partition")]
    pub partition: PathBuf,
    /// Percentage of the free disk space on the partition to fill.
    #[serde(default = "default_partition_pct")]
    pub partition_pct: f64,
    /// Maximum size of each filler file; larger fills use several files.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Name of the filler directory, relative to the partition.
    #[serde(default = "default_disk_fill_dir")]
    pub disk_fill_dir: String,
}

fn default_partition() -> PathBuf {
    PathBuf::from("/etc")
}

fn default_partition_pct() -> f64 {
    80.0
}

fn default_max_file_size() -> u64 {
    1024 * 1024 * 1024 * 20
}

fn default_disk_fill_dir() -> String {
    "ychaos_diskfill".to_string()
}

/// Free bytes available to unprivileged users on the filesystem of `path`.
fn free_space(path: &Path) -> std::io::Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    Ok(u64::from(stat.blocks_available()) * u64::from(stat.fragment_size()))
}

impl DiskFillConfig {
    /// The number of bytes to fill: `partition_pct / 100` of the free space.
    pub fn effective_disk_to_fill(&self) -> std::io::Result<u64> {
        let available = free_space(&self.partition)?;
        Ok((self.partition_pct / 100.0 * available as f64).floor() as u64)
    }

    fn fill_dir(&self) -> PathBuf {
        self.partition.join(&self.disk_fill_dir)
    }

    pub(crate) fn validate(&self) -> Result<(), PlanError> {
        if !(self.partition_pct > 0.0 && self.partition_pct <= 100.0) {
            return Err(PlanError::AgentConfig {
                agent: "disk_fill".into(),
                reason: format!(
                    "partition_pct must be within (0, 100], got {}",
                    self.partition_pct
                ),
            });
        }
        if self.max_file_size <= 1024 {
            return Err(PlanError::AgentConfig {
                agent: "disk_fill".into(),
                reason: "max_file_size must be larger than 1024 bytes".into(),
            });
        }
        Ok(())
    }
}

/// The disk fill agent.
pub struct DiskFill {
    config: DiskFillConfig,
    lifecycle: AgentLifecycle,
}

impl DiskFill {
    /// Build the agent from its validated config.
    pub fn new(mut config: DiskFillConfig) -> Self {
        config.base.ensure_named("disk_fill");
        Self {
            config,
            lifecycle: AgentLifecycle::new(),
        }
    }
}

#[async_trait]
impl Agent for DiskFill {
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
        let size = self.config.effective_disk_to_fill()?;
        if size == 0 {
            return Ok(());
        }
        let fill_dir = self.config.fill_dir();
        tokio::fs::create_dir_all(&fill_dir).await?;

        let cancel = self.lifecycle.cancel_token();
        let mut space_remaining = size;
        let mut index = 0u32;
        while space_remaining > 0 {
            if cancel.is_cancelled() {
                break;
            }
            let file_size = space_remaining.min(self.config.max_file_size);
            space_remaining -= file_size;
            let file = tokio::fs::File::create(fill_dir.join(format!("filler{index}.txt"))).await?;
            file.set_len(file_size).await?;
            index += 1;
        }
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        let fill_dir = self.config.fill_dir();
        if tokio::fs::try_exists(&fill_dir).await? {
            tokio::fs::remove_dir_all(&fill_dir).await?;
        }
        Ok(())
    }

    async fn monitor(&self) {
        let mut data = BTreeMap::new();
        if let Ok(to_fill) = self.config.effective_disk_to_fill() {
            data.insert("disk_space_to_fill".to_string(), serde_json::json!(to_fill));
        }
        if let Ok(free) = free_space(&self.config.partition) {
            data.insert("disk_free_space".to_string(), serde_json::json!(free));
        }
        self.lifecycle
            .push_status(AgentMonitoringDataPoint::now(self.lifecycle.current_state(), data));
    }
}
