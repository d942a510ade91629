//! Contrib agent: the single open variant of the agent registry.
//!
//! A contrib agent is a side-loaded executable honouring a small subcommand
//! contract:
//!
//! ```text
//! <agent> validate-config --config <json>   # exit 0 when the config is valid
//! <agent> setup           --config <json>
//! <agent> run             --config <json>   # killed on cooperative stop
//! <agent> teardown        --config <json>
//! ```
//!
//! The nested `config` subtree is owned by the contrib agent; the framework
//! validates it by asking the executable, before the agent is scheduled.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::{Agent, AgentError, AgentLifecycle, BaseAgentFields};
use ychaos_core::PlanError;

/// Configuration of a contrib agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContribAgentConfig {
    /// Shared agent fields.
    #[serde(flatten)]
    pub base: BaseAgentFields,
    /// Path of the contrib agent executable.
    pub path: PathBuf,
    /// Run window in seconds, when the contrib agent is time-bound.
    #[serde(default)]
    pub duration: Option<u64>,
    /// The configuration handed through to the contrib agent.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// An agent implemented by an external executable.
pub struct ContribAgent {
    config: ContribAgentConfig,
    config_json: String,
    lifecycle: AgentLifecycle,
}

impl ContribAgent {
    /// Build the agent, checking the executable exists and accepts the
    /// nested config. Both checks fail the plan before anything runs.
    pub fn load(mut config: ContribAgentConfig) -> Result<Self, PlanError> {
        config.base.ensure_named("contrib");

        let metadata = std::fs::metadata(&config.path).map_err(|error| PlanError::AgentConfig {
            agent: config.base.name.clone(),
            reason: format!("contrib agent {} not readable: {error}", config.path.display()),
        })?;
        if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
            return Err(PlanError::AgentConfig {
                agent: config.base.name.clone(),
                reason: format!("contrib agent {} is not executable", config.path.display()),
            });
        }

        let config_json = config.config.to_string();
        let validated = std::process::Command::new(&config.path)
            .arg("validate-config")
            .arg("--config")
            .arg(&config_json)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|error| PlanError::AgentConfig {
                agent: config.base.name.clone(),
                reason: format!("contrib agent failed to start: {error}"),
            })?;
        if !validated.success() {
            return Err(PlanError::AgentConfig {
                agent: config.base.name.clone(),
                reason: "contrib agent rejected its configuration".into(),
            });
        }

        Ok(Self {
            config,
            config_json,
            lifecycle: AgentLifecycle::new(),
        })
    }

    async fn invoke(&self, subcommand: &str) -> anyhow::Result<()> {
        let status = tokio::process::Command::new(&self.config.path)
            .arg(subcommand)
            .arg("--config")
            .arg(&self.config_json)
            .status()
            .await?;
        if !status.success() {
            return Err(AgentError::Failed(format!(
                "contrib agent {subcommand} exited with {status}"
            ))
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for ContribAgent {
    fn base(&self) -> &BaseAgentFields {
        &self.config.base
    }

    fn duration(&self) -> Option<u64> {
        self.config.duration
    }

    fn lifecycle(&self) -> &AgentLifecycle {
        &self.lifecycle
    }

    async fn setup(&self) -> anyhow::Result<()> {
        self.invoke("setup").await
    }

    /// Runs the executable's `run` phase, killing it when the cooperative
    /// stop flag fires.
    async fn run(&self) -> anyhow::Result<()> {
        let mut child = tokio::process::Command::new(&self.config.path)
            .arg("run")
            .arg("--config")
            .arg(&self.config_json)
            .spawn()?;

        let cancel = self.lifecycle.cancel_token();
        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if !status.success() {
                    return Err(AgentError::Failed(format!(
                        "contrib agent run exited with {status}"
                    ))
                    .into());
                }
            }
            _ = cancel.cancelled() => {
                child.kill().await.ok();
            }
        }
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        self.invoke("teardown").await
    }
}
