//! YChaos Executor
//!
//! Target executors: given a validated test plan, decide where the attack
//! engine runs. The `self` executor drives a coordinator in this process;
//! the `machine` executor computes the blast-radius host sample and walks an
//! external remote-shell driver through the per-host task sequence.

pub mod machine;
pub mod self_target;

pub use machine::{
    MachineExecutorEvent, MachineTargetExecutor, RemoteShell, RemoteTask,
    MACHINE_EXECUTOR_EVENTS,
};
pub use self_target::{SelfExecutorEvent, SelfTargetExecutor, SELF_EXECUTOR_EVENTS};

use thiserror::Error;

/// Errors surfaced by the target executors.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The plan's target type does not fit this executor.
    #[error("target configuration is not processable for this executor")]
    TargetTypeMismatch,

    /// A plan configuration problem.
    #[error(transparent)]
    Plan(#[from] ychaos_core::PlanError),

    /// The coordinator refused to run.
    #[error(transparent)]
    Coordinator(#[from] ychaos_agents::CoordinatorError),

    /// A raising hook listener failed.
    #[error(transparent)]
    Hook(#[from] ychaos_core::hooks::HookError),

    /// Filesystem trouble around the report directory.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
