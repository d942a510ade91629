//! The test plan document.
//!
//! A plan is the declarative input of one engine run: an attack (target,
//! execution mode, ordered agent list) and an ordered list of verifications.
//! The engines consume it read-only. Parsing produces a structurally valid
//! plan; [`TestPlan::validate`] additionally enforces the semantic rules
//! (blast-radius bounds, host well-formedness, non-empty agent list) that the
//! schema alone cannot express.

pub mod attack;
pub mod hosts;
pub mod metrics;
pub mod verification;

use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{PlanError, Result};
use attack::AttackConfig;
use verification::VerificationConfig;

pub use attack::{AgentExecutionConfig, AgentType, AttackMode, TargetConfig};
pub use hosts::Fqdn;

/// The label under which a verification pass runs.
///
/// The caller supplies the state per pass: STEADY before the attack, CHAOS
/// during, RECOVERED after.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum SystemState {
    /// The system before any fault is injected.
    Steady,
    /// The system while the attack is in progress.
    Chaos,
    /// The system after the attack has been torn down.
    Recovered,
}

impl SystemState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 3] = [Self::Steady, Self::Chaos, Self::Recovered];

    /// The canonical uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Steady => "STEADY",
            Self::Chaos => "CHAOS",
            Self::Recovered => "RECOVERED",
        }
    }
}

/// The test plan: one attack and its verifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlan {
    /// Stable identifier for this plan.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Description of the test performed in this plan.
    #[serde(default)]
    pub description: String,
    /// Verifications executed to check the system is in a favorable state.
    #[serde(default)]
    pub verification: Vec<VerificationConfig>,
    /// The configuration used to create chaos.
    pub attack: AttackConfig,
}

impl TestPlan {
    /// Parse a plan from YAML and validate it.
    pub fn from_yaml(document: &str) -> Result<Self> {
        let plan: Self = serde_yaml::from_str(document)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Parse a plan from JSON and validate it.
    pub fn from_json(document: &str) -> Result<Self> {
        let plan: Self = serde_json::from_str(document)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Load a plan document from disk. YAML accepts JSON as a subset, so a
    /// single parse path covers both encodings.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let document = std::fs::read_to_string(path)?;
        Self::from_yaml(&document)
    }

    /// Serialize the plan as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Serialize the plan as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Enforce the semantic invariants the schema cannot express.
    pub fn validate(&self) -> Result<()> {
        self.attack.validate()?;
        for (index, config) in self.verification.iter().enumerate() {
            config
                .validate()
                .map_err(|error| PlanError::Invalid(format!("verification[{index}]: {error}")))?;
        }
        Ok(())
    }

    /// The verification configurations applicable in `state`, in plan order.
    pub fn filter_verification_by_state(&self, state: SystemState) -> Vec<&VerificationConfig> {
        self.verification
            .iter()
            .filter(|config| config.states.contains(&state))
            .collect()
    }
}
