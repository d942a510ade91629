//! CPU burn agent: consumes CPU on a percentage of the cores for the
//! configured duration.

use std::collections::BTreeMap;
use std::hint::black_box;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::agent::{
    default_duration, Agent, AgentLifecycle, AgentMonitoringDataPoint, BaseAgentFields,
};
use ychaos_core::PlanError;

/// Configuration of the CPU burn attack. Only `cores_pct` percent of the
/// available cores are targeted; the default of 100 burns all of them
/// simultaneously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuBurnConfig {
    /// Shared agent fields.
    #[serde(flatten)]
    pub base: BaseAgentFields,
    /// The duration for which this agent should run.
    #[serde(default = "default_duration")]
    pub duration: u64,
    /// Percentage of all the cores to burn.
    #[serde(default = "default_cores_pct")]
    pub cores_pct: f64,
}

fn default_cores_pct() -> f64 {
    100.0
}

impl CpuBurnConfig {
    /// The number of cores that fits in the `cores_pct` percentage.
    pub fn effective_cpu_count(&self) -> usize {
        let cores = std::thread::available_parallelism().map_or(1, usize::from);
        (self.cores_pct * cores as f64 / 100.0).floor() as usize
    }

    pub(crate) fn validate(&self) -> Result<(), PlanError> {
        if !(0.0..=100.0).contains(&self.cores_pct) {
            return Err(PlanError::AgentConfig {
                agent: "cpu_burn".into(),
                reason: format!("cores_pct must be within [0, 100], got {}", self.cores_pct),
            });
        }
        Ok(())
    }
}

/// The CPU burn agent.
pub struct CpuBurn {
    config: CpuBurnConfig,
    lifecycle: AgentLifecycle,
    system: Mutex<System>,
}

impl CpuBurn {
    /// Build the agent from its validated config.
    pub fn new(mut config: CpuBurnConfig) -> Self {
        config.base.ensure_named("cpu_burn");
        Self {
            config,
            lifecycle: AgentLifecycle::new(),
            system: Mutex::new(System::new()),
        }
    }
}

fn burn_until(end: chrono::DateTime<Utc>, cancel: tokio_util::sync::CancellationToken) {
    let mut x: u64 = 0x9e37_79b9;
    while Utc::now() < end && !cancel.is_cancelled() {
        // A chunk of arithmetic between cancellation checkpoints.
        for _ in 0..100_000 {
            x = black_box(x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407));
        }
    }
    black_box(x);
}

#[async_trait]
impl Agent for CpuBurn {
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

    /// Spawns one spinning worker per targeted core and returns; the workers
    /// terminate on their own at the end instant or on cooperative stop.
    async fn run(&self) -> anyhow::Result<()> {
        let workers = self.config.effective_cpu_count();
        if workers == 0 {
            return Ok(());
        }
        let end = Utc::now() + Duration::seconds(self.config.duration as i64);
        for _ in 0..workers {
            let cancel = self.lifecycle.cancel_token();
            tokio::task::spawn_blocking(move || burn_until(end, cancel));
        }
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn monitor(&self) {
        {
            self.system.lock().refresh_cpu_usage();
        }
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        let cpu_usage = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            let cpus = system.cpus();
            if cpus.is_empty() {
                f64::NAN
            } else {
                f64::from(cpus.iter().map(sysinfo::Cpu::cpu_usage).sum::<f32>())
                    / cpus.len() as f64
            }
        };

        let mut data = BTreeMap::new();
        data.insert(
            "cpu_count".to_string(),
            serde_json::json!(self.config.effective_cpu_count()),
        );
        data.insert("cpu_usage".to_string(), serde_json::json!(cpu_usage));
        self.lifecycle
            .push_status(AgentMonitoringDataPoint::now(self.lifecycle.current_state(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cores_pct: f64) -> CpuBurnConfig {
        serde_json::from_value(serde_json::json!({"cores_pct": cores_pct, "duration": 1}))
            .expect("config")
    }

    #[test]
    fn effective_count_scales_with_percentage() {
        let cores = std::thread::available_parallelism().map_or(1, usize::from);
        assert_eq!(config(100.0).effective_cpu_count(), cores);
        assert_eq!(config(0.0).effective_cpu_count(), 0);
    }

    #[test]
    fn out_of_range_percentage_is_a_config_error() {
        assert!(config(120.0).validate().is_err());
        assert!(config(-1.0).validate().is_err());
        assert!(config(50.0).validate().is_ok());
    }

    #[tokio::test]
    async fn zero_cores_run_is_a_noop() {
        let agent = CpuBurn::new(config(0.0));
        agent.run().await.expect("run");
    }
}
