//! YChaos Core
//!
//! Shared foundation for the YChaos resilience testing framework: the test
//! plan model consumed read-only by the attack and verification engines, the
//! event hook bus those engines expose to external collaborators, and secret
//! resolution.

pub mod hooks;
pub mod secrets;
pub mod testplan;

pub use hooks::{EventListener, HookError, HookEvent, HookRegistry};
pub use secrets::{EnvResolver, SecretError, SecretRef, SecretResolver, SecretValue};
pub use testplan::{AttackMode, SystemState, TestPlan};

use thiserror::Error;

/// Errors raised while building or validating a test plan.
///
/// Plan configuration errors are the one family that propagates to the
/// caller: execution cannot meaningfully proceed on a malformed plan.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("invalid test plan: {0}")]
    Invalid(String),

    #[error("`{0}` is not a valid FQDN")]
    InvalidFqdn(String),

    #[error("`{0}` is not a valid host pattern")]
    InvalidHostPattern(String),

    #[error("agent `{agent}` configuration: {reason}")]
    AgentConfig { agent: String, reason: String },

    #[error("target configuration is not processable for this executor")]
    TargetTypeMismatch,

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-level result alias.
pub type Result<T> = std::result::Result<T, PlanError>;
