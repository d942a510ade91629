//! The `machine` target executor contract.
//!
//! The executor computes the effective host set, samples a blast-radius
//! share of it, and walks each selected host through a fixed task sequence.
//! The remote-shell protocol itself is not part of the core: an external
//! driver implements [`RemoteShell`] and receives the tasks in order.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use tracing::{info, warn};

use ychaos_core::hooks::{EventListener, HookError, HookEvent, HookRegistry};
use ychaos_core::testplan::attack::MachineTargetDefinition;
use ychaos_core::testplan::{Fqdn, TargetConfig, TestPlan};

use crate::ExecutorError;

/// One step of the per-host provisioning and attack sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTask {
    /// Check the working directory on the host.
    CheckWorkingDirectory,
    /// Check the runtime interpreter is available on the host.
    CheckInterpreter,
    /// Create an isolated runtime environment.
    CreateRuntimeEnvironment,
    /// Install the attack engine into the runtime environment.
    InstallCore,
    /// Create the workspace directory for run artefacts.
    CreateWorkspace,
    /// Ship the plan document into the workspace.
    CopyTestPlan {
        /// The plan serialized as JSON.
        document: String,
    },
    /// Run the attack through the installed engine.
    RunAttack,
    /// Archive the workspace, report and logs included.
    ArchiveWorkspace,
    /// Fetch the workspace archive back to the invoking host.
    FetchArchive {
        /// Local directory receiving the archive.
        destination: PathBuf,
    },
    /// Delete the workspace on the host.
    DeleteWorkspace,
    /// Delete the runtime environment on the host.
    DeleteRuntimeEnvironment,
}

impl RemoteTask {
    /// A short name for logs and hook payloads.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CheckWorkingDirectory => "check_working_directory",
            Self::CheckInterpreter => "check_interpreter",
            Self::CreateRuntimeEnvironment => "create_runtime_environment",
            Self::InstallCore => "install_core",
            Self::CreateWorkspace => "create_workspace",
            Self::CopyTestPlan { .. } => "copy_test_plan",
            Self::RunAttack => "run_attack",
            Self::ArchiveWorkspace => "archive_workspace",
            Self::FetchArchive { .. } => "fetch_archive",
            Self::DeleteWorkspace => "delete_workspace",
            Self::DeleteRuntimeEnvironment => "delete_runtime_environment",
        }
    }
}

/// The transport an external remote driver implements.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run one task on one host.
    async fn run_task(&self, host: &Fqdn, task: &RemoteTask) -> anyhow::Result<()>;
}

/// Lifecycle events fired by the machine executor.
#[derive(Debug, Clone)]
pub enum MachineExecutorEvent {
    /// The per-host sequences are about to start.
    Start,
    /// The blast-radius sample is empty; nothing will run.
    NoTargetsFound,
    /// A host completed its full task sequence.
    TargetPassed {
        /// The host.
        host: String,
    },
    /// A task failed on a host; its sequence was abandoned.
    TargetFailed {
        /// The host.
        host: String,
        /// The failing task.
        task: String,
    },
    /// A host could not be reached at all.
    TargetUnreachable {
        /// The host.
        host: String,
    },
    /// Every host sequence has finished.
    End,
    /// The executor itself failed.
    Error {
        /// Error description.
        message: String,
    },
}

impl HookEvent for MachineExecutorEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "on_start",
            Self::NoTargetsFound => "on_no_targets_found",
            Self::TargetPassed { .. } => "on_target_passed",
            Self::TargetFailed { .. } => "on_target_failed",
            Self::TargetUnreachable { .. } => "on_target_unreachable",
            Self::End => "on_end",
            Self::Error { .. } => "on_error",
        }
    }
}

/// The events external collaborators can register hooks for.
pub const MACHINE_EXECUTOR_EVENTS: &[&str] = &[
    "on_start",
    "on_no_targets_found",
    "on_target_passed",
    "on_target_failed",
    "on_target_unreachable",
    "on_end",
    "on_error",
];

/// Executes the attack on a blast-radius sample of remote machines through a
/// [`RemoteShell`] driver.
pub struct MachineTargetExecutor {
    testplan: TestPlan,
    target: MachineTargetDefinition,
    target_hosts: Vec<Fqdn>,
    hooks: HookRegistry<MachineExecutorEvent>,
}

impl MachineTargetExecutor {
    /// Build the executor: checks the target type, computes the effective
    /// hosts and draws the blast-radius sample.
    pub fn new(testplan: TestPlan) -> Result<Self, ExecutorError> {
        let TargetConfig::Machine(target) = &testplan.attack.target else {
            return Err(ExecutorError::TargetTypeMismatch);
        };
        let target = target.clone();

        let effective_hosts = target.effective_hosts()?;
        let sample_size =
            (target.blast_radius as usize).saturating_mul(effective_hosts.len()) / 100;
        let target_hosts: Vec<Fqdn> = effective_hosts
            .choose_multiple(&mut rand::rng(), sample_size)
            .cloned()
            .collect();

        Ok(Self {
            testplan,
            target,
            target_hosts,
            hooks: HookRegistry::new(MACHINE_EXECUTOR_EVENTS),
        })
    }

    /// Register a hook listener for one of [`MACHINE_EXECUTOR_EVENTS`].
    pub fn register_hook(
        &mut self,
        event_name: &str,
        listener: Arc<dyn EventListener<MachineExecutorEvent>>,
    ) -> Result<(), HookError> {
        self.hooks.register_hook(event_name, listener)
    }

    /// Register a closure as a hook listener.
    pub fn register_fn<F>(&mut self, event_name: &str, hook: F) -> Result<(), HookError>
    where
        F: Fn(&MachineExecutorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.register_fn(event_name, hook)
    }

    /// The hosts selected for this run.
    pub fn target_hosts(&self) -> &[Fqdn] {
        &self.target_hosts
    }

    /// The ordered per-host task sequence the remote driver executes.
    pub fn task_sequence(&self) -> Result<Vec<RemoteTask>, ExecutorError> {
        let document = self.testplan.to_json()?;
        Ok(vec![
            RemoteTask::CheckWorkingDirectory,
            RemoteTask::CheckInterpreter,
            RemoteTask::CreateRuntimeEnvironment,
            RemoteTask::InstallCore,
            RemoteTask::CreateWorkspace,
            RemoteTask::CopyTestPlan { document },
            RemoteTask::RunAttack,
            RemoteTask::ArchiveWorkspace,
            RemoteTask::FetchArchive {
                destination: self.target.report_dir.clone(),
            },
            RemoteTask::DeleteWorkspace,
            RemoteTask::DeleteRuntimeEnvironment,
        ])
    }

    async fn execute_host(
        &self,
        shell: &dyn RemoteShell,
        host: &Fqdn,
        tasks: &[RemoteTask],
    ) -> Result<(), HookError> {
        for (index, task) in tasks.iter().enumerate() {
            if let Err(error) = shell.run_task(host, task).await {
                warn!(host = %host, task = task.name(), error = %error, "remote task failed");
                if index == 0 {
                    self.hooks.emit(&MachineExecutorEvent::TargetUnreachable {
                        host: host.to_string(),
                    })?;
                } else {
                    self.hooks.emit(&MachineExecutorEvent::TargetFailed {
                        host: host.to_string(),
                        task: task.name().to_string(),
                    })?;
                }
                return Ok(());
            }
        }
        self.hooks.emit(&MachineExecutorEvent::TargetPassed {
            host: host.to_string(),
        })?;
        Ok(())
    }

    /// Walk every sampled host through the task sequence using `shell`.
    ///
    /// An empty sample fires `on_no_targets_found` and starts nothing.
    pub async fn execute_with(&self, shell: &dyn RemoteShell) -> Result<(), ExecutorError> {
        if self.target_hosts.is_empty() {
            self.hooks.emit(&MachineExecutorEvent::NoTargetsFound)?;
            return Ok(());
        }

        let tasks = self.task_sequence()?;
        tokio::fs::create_dir_all(&self.target.report_dir).await?;

        info!(hosts = self.target_hosts.len(), "starting machine attack");
        self.hooks.emit(&MachineExecutorEvent::Start)?;
        let host_runs = self
            .target_hosts
            .iter()
            .map(|host| self.execute_host(shell, host, &tasks));
        for outcome in futures::future::join_all(host_runs).await {
            outcome?;
        }
        self.hooks.emit(&MachineExecutorEvent::End)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn plan(blast_radius: u8, report_dir: &std::path::Path) -> TestPlan {
        TestPlan::from_yaml(&format!(
            r#"
attack:
  target_type: machine
  target_config:
    blast_radius: {blast_radius}
    hostnames: [h01.example.com, h02.example.com, h03.example.com, h04.example.com]
    report_dir: {}
  agents:
    - type: no_op
"#,
            report_dir.display()
        ))
        .expect("plan")
    }

    struct RecordingShell {
        calls: Mutex<Vec<(String, &'static str)>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingShell {
        fn new(fail_on: Option<&'static str>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on,
            }
        }
    }

    #[async_trait]
    impl RemoteShell for RecordingShell {
        async fn run_task(&self, host: &Fqdn, task: &RemoteTask) -> anyhow::Result<()> {
            self.calls.lock().push((host.to_string(), task.name()));
            if self.fail_on == Some(task.name()) {
                anyhow::bail!("rigged task failure");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn zero_blast_radius_yields_no_targets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut executor = MachineTargetExecutor::new(plan(0, dir.path())).expect("executor");
        assert!(executor.target_hosts().is_empty());

        let fired = std::sync::Arc::new(AtomicUsize::new(0));
        {
            let fired = std::sync::Arc::clone(&fired);
            executor
                .register_fn("on_no_targets_found", move |_event| {
                    fired.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .expect("register");
        }

        let shell = RecordingShell::new(None);
        executor.execute_with(&shell).await.expect("execute");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(shell.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn half_blast_radius_samples_half_the_hosts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = MachineTargetExecutor::new(plan(50, dir.path())).expect("executor");
        assert_eq!(executor.target_hosts().len(), 2);
    }

    #[tokio::test]
    async fn full_sequence_runs_in_order_on_every_host() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut executor = MachineTargetExecutor::new(plan(100, dir.path())).expect("executor");

        let passed = std::sync::Arc::new(AtomicUsize::new(0));
        {
            let passed = std::sync::Arc::clone(&passed);
            executor
                .register_fn("on_target_passed", move |_event| {
                    passed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .expect("register");
        }

        let shell = RecordingShell::new(None);
        executor.execute_with(&shell).await.expect("execute");
        assert_eq!(passed.load(Ordering::SeqCst), 4);

        let calls = shell.calls.lock();
        let first_host_tasks: Vec<&str> = calls
            .iter()
            .filter(|(host, _)| host == "h01.example.com")
            .map(|(_, task)| *task)
            .collect();
        assert_eq!(
            first_host_tasks,
            vec![
                "check_working_directory",
                "check_interpreter",
                "create_runtime_environment",
                "install_core",
                "create_workspace",
                "copy_test_plan",
                "run_attack",
                "archive_workspace",
                "fetch_archive",
                "delete_workspace",
                "delete_runtime_environment",
            ]
        );
    }

    #[tokio::test]
    async fn failed_task_abandons_the_host_and_fires_target_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut executor = MachineTargetExecutor::new(plan(100, dir.path())).expect("executor");

        let failed = std::sync::Arc::new(Mutex::new(Vec::new()));
        {
            let failed = std::sync::Arc::clone(&failed);
            executor
                .register_fn("on_target_failed", move |event| {
                    if let MachineExecutorEvent::TargetFailed { task, .. } = event {
                        failed.lock().push(task.clone());
                    }
                    Ok(())
                })
                .expect("register");
        }

        let shell = RecordingShell::new(Some("run_attack"));
        executor.execute_with(&shell).await.expect("execute");

        let failed = failed.lock();
        assert_eq!(failed.len(), 4);
        assert!(failed.iter().all(|task| task == "run_attack"));
        // Nothing past the failing task ran.
        assert!(!shell
            .calls
            .lock()
            .iter()
            .any(|(_, task)| *task == "archive_workspace"));
    }

    #[tokio::test]
    async fn plan_document_ships_with_the_copy_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = MachineTargetExecutor::new(plan(100, dir.path())).expect("executor");
        let tasks = executor.task_sequence().expect("tasks");
        let Some(RemoteTask::CopyTestPlan { document }) = tasks
            .iter()
            .find(|task| matches!(task, RemoteTask::CopyTestPlan { .. }))
        else {
            panic!("copy task missing");
        };
        let shipped: serde_json::Value = serde_json::from_str(document).expect("json");
        assert_eq!(shipped["attack"]["target_type"], "machine");
    }
}
