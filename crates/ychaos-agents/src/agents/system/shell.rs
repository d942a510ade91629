//! Shell agent: runs an arbitrary shell command as the attack body.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::agent::{default_duration, Agent, AgentLifecycle, BaseAgentFields};

/// Configuration of the shell agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Shared agent fields.
    #[serde(flatten)]
    pub base: BaseAgentFields,
    /// The duration for which this agent should run.
    #[serde(default = "default_duration")]
    pub duration: u64,
    /// The shell command to be executed.
    pub command: String,
}

/// The shell agent.
pub struct Shell {
    config: ShellConfig,
    lifecycle: AgentLifecycle,
}

impl Shell {
    /// Build the agent from its validated config.
    pub fn new(mut config: ShellConfig) -> Self {
        config.base.ensure_named("shell");
        Self {
            config,
            lifecycle: AgentLifecycle::new(),
        }
    }
}

#[async_trait]
impl Agent for Shell {
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

    /// Runs the command and waits for it. The command is killed when the
    /// cooperative stop flag fires. The command's exit status is recorded
    /// but does not fail the agent.
    async fn run(&self) -> anyhow::Result<()> {
        let mut child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(&self.config.command)
            .spawn()?;

        let cancel = self.lifecycle.cancel_token();
        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if !status.success() {
                    warn!(agent = self.name(), %status, "shell command exited non-zero");
                }
            }
            _ = cancel.cancelled() => {
                child.kill().await.ok();
            }
        }
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{setup_guarded, start_async, teardown_async, AgentState};
    use std::sync::Arc;

    fn shell(command: &str) -> Arc<dyn Agent> {
        let config: ShellConfig =
            serde_json::from_value(serde_json::json!({"command": command, "duration": 1}))
                .expect("config");
        Arc::new(Shell::new(config))
    }

    #[tokio::test]
    async fn command_output_does_not_fail_the_agent() {
        let agent = shell("true");
        setup_guarded(agent.as_ref()).await.expect("setup");
        start_async(Arc::clone(&agent)).await.expect("runner");
        teardown_async(Arc::clone(&agent)).await.expect("stopper");
        assert_eq!(agent.lifecycle().current_state(), AgentState::Done);
    }

    #[tokio::test]
    async fn non_zero_exit_is_tolerated() {
        let agent = shell("exit 3");
        setup_guarded(agent.as_ref()).await.expect("setup");
        start_async(Arc::clone(&agent)).await.expect("runner");
        assert!(!agent.lifecycle().has_errors());
    }

    #[tokio::test]
    async fn long_running_command_is_killed_on_stop() {
        let agent = shell("sleep 3600");
        setup_guarded(agent.as_ref()).await.expect("setup");
        let _runner = start_async(Arc::clone(&agent));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let teardown = teardown_async(Arc::clone(&agent));
        tokio::time::timeout(std::time::Duration::from_secs(5), teardown)
            .await
            .expect("teardown finishes promptly")
            .expect("join");
        assert_eq!(agent.lifecycle().current_state(), AgentState::Done);
    }
}
