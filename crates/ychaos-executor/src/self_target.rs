//! The `self` target executor: runs the attack engine in this very process
//! and writes the attack report under the target's report directory.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use ychaos_agents::coordinator::Coordinator;
use ychaos_core::hooks::{EventListener, HookError, HookEvent, HookRegistry};
use ychaos_core::testplan::{TargetConfig, TestPlan};

use crate::ExecutorError;

/// Lifecycle events fired by the self executor.
#[derive(Debug, Clone)]
pub enum SelfExecutorEvent {
    /// The attack is about to start.
    Start,
    /// The attack finished with the given exit code.
    End {
        /// Exit code of the attack.
        exit_code: i32,
    },
    /// The executor hit an error before or after the attack.
    Error {
        /// Error description.
        message: String,
    },
}

impl HookEvent for SelfExecutorEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "on_start",
            Self::End { .. } => "on_end",
            Self::Error { .. } => "on_error",
        }
    }
}

/// The events external collaborators can register hooks for.
pub const SELF_EXECUTOR_EVENTS: &[&str] = &["on_start", "on_end", "on_error"];

const REPORT_FILE: &str = "attack_report.yaml";

/// Executes the agents on the machine where the tool was invoked.
pub struct SelfTargetExecutor {
    testplan: TestPlan,
    report_dir: PathBuf,
    exit_code: i32,
    hooks: HookRegistry<SelfExecutorEvent>,
}

impl SelfTargetExecutor {
    /// Build the executor, checking the plan targets `self`.
    pub fn new(testplan: TestPlan) -> Result<Self, ExecutorError> {
        let TargetConfig::SelfTarget(target) = &testplan.attack.target else {
            return Err(ExecutorError::TargetTypeMismatch);
        };
        let report_dir = target.report_dir.clone();
        Ok(Self {
            testplan,
            report_dir,
            exit_code: 0,
            hooks: HookRegistry::new(SELF_EXECUTOR_EVENTS),
        })
    }

    /// Register a hook listener for one of [`SELF_EXECUTOR_EVENTS`].
    pub fn register_hook(
        &mut self,
        event_name: &str,
        listener: Arc<dyn EventListener<SelfExecutorEvent>>,
    ) -> Result<(), HookError> {
        self.hooks.register_hook(event_name, listener)
    }

    /// Register a closure as a hook listener.
    pub fn register_fn<F>(&mut self, event_name: &str, hook: F) -> Result<(), HookError>
    where
        F: Fn(&SelfExecutorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.register_fn(event_name, hook)
    }

    /// The exit code of the last execution.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Path of the report written by the last execution.
    pub fn report_path(&self) -> PathBuf {
        self.report_dir.join(REPORT_FILE)
    }

    /// Run the attack locally and persist the report.
    pub async fn execute(&mut self) -> Result<(), ExecutorError> {
        tokio::fs::create_dir_all(&self.report_dir).await?;

        let mut coordinator = Coordinator::new(self.testplan.clone());
        coordinator.configure_agents_in_plan()?;

        self.hooks.emit(&SelfExecutorEvent::Start)?;
        let attack = coordinator.start_attack().await;
        let exit_code = match attack {
            Ok(exit_code) => exit_code,
            Err(error) => {
                self.hooks.emit(&SelfExecutorEvent::Error {
                    message: error.to_string(),
                })?;
                return Err(error.into());
            }
        };
        self.exit_code = exit_code;

        let report = coordinator.generate_attack_report();
        let document = report
            .to_yaml()
            .map_err(ychaos_core::PlanError::from)?;
        tokio::fs::write(self.report_path(), document).await?;
        info!(report = %self.report_path().display(), exit_code, "attack report written");

        self.hooks.emit(&SelfExecutorEvent::End { exit_code })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ychaos_agents::coordinator::AttackReport;

    fn plan_for(report_dir: &std::path::Path) -> TestPlan {
        TestPlan::from_yaml(&format!(
            r#"
attack:
  target_type: self
  target_config:
    report_dir: {}
  agents:
    - type: no_op_timed
      config:
        start_delay: 0
        duration: 1
"#,
            report_dir.display()
        ))
        .expect("plan")
    }

    #[test]
    fn machine_plans_are_rejected() {
        let plan = TestPlan::from_yaml(
            r#"
attack:
  target_type: machine
  target_config:
    blast_radius: 10
    hostnames: [a.example.com]
  agents:
    - type: no_op
"#,
        )
        .expect("plan");
        assert!(matches!(
            SelfTargetExecutor::new(plan),
            Err(ExecutorError::TargetTypeMismatch)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attack_report_lands_in_the_report_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut executor = SelfTargetExecutor::new(plan_for(dir.path())).expect("executor");

        executor.execute().await.expect("execute");
        assert_eq!(executor.exit_code(), 0);

        let document = std::fs::read_to_string(executor.report_path()).expect("report");
        let report = AttackReport::from_yaml(&document).expect("parse");
        assert_eq!(report.agents.len(), 1);
        assert_eq!(report.agents[0].status, "DONE");
    }
}
