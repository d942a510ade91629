//! The verification controller: runs a plan's verification list in order for
//! one labelled system state, honouring strict/non-strict gating, and
//! extends the accumulated per-state verification data in place.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use ychaos_core::hooks::{EventListener, HookError, HookEvent, HookRegistry};
use ychaos_core::testplan::verification::VerificationType;
use ychaos_core::testplan::{SystemState, TestPlan};

use crate::data::{VerificationData, VerificationStateData};
use crate::plugins;

/// Errors surfaced by the controller. Plugin failures never take this path;
/// they are encoded in the returned state data.
#[derive(Error, Debug)]
pub enum VerificationError {
    /// The prior verification data does not line up with the plan.
    #[error("verification data and verification config size mismatch")]
    SizeMismatch,

    /// A raising hook listener failed.
    #[error(transparent)]
    Hook(#[from] HookError),
}

/// Lifecycle events fired by the controller.
#[derive(Debug, Clone)]
pub enum VerificationEvent {
    /// Verification execution is about to start.
    Start,
    /// A plugin is about to run. `index` is the position in the plan.
    PluginStart {
        /// Position in the plan's verification list.
        index: usize,
        /// The plugin kind.
        plugin_type: VerificationType,
    },
    /// A plugin finished running.
    PluginEnd {
        /// Position in the plan's verification list.
        index: usize,
        /// The plugin kind.
        plugin_type: VerificationType,
        /// The state data the plugin returned.
        state_data: VerificationStateData,
    },
    /// A schema-valid plugin kind has no implementation yet.
    PluginNotFound {
        /// Position in the plan's verification list.
        index: usize,
        /// The plugin kind.
        plugin_type: VerificationType,
    },
    /// Verification execution ended. One flag per strict plugin that ran.
    End {
        /// The strict-plugin pass list.
        results: Vec<bool>,
    },
}

impl HookEvent for VerificationEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "on_start",
            Self::PluginStart { .. } => "on_each_plugin_start",
            Self::PluginEnd { .. } => "on_each_plugin_end",
            Self::PluginNotFound { .. } => "on_plugin_not_found",
            Self::End { .. } => "on_end",
        }
    }
}

/// The events external collaborators can register hooks for.
pub const VERIFICATION_EVENTS: &[&str] = &[
    "on_start",
    "on_each_plugin_start",
    "on_each_plugin_end",
    "on_plugin_not_found",
    "on_end",
];

/// Runs all verification plugins configured in the test plan and asserts the
/// system is in the state the user expects.
pub struct VerificationController {
    testplan: TestPlan,
    current_state: SystemState,
    verification_data: Vec<VerificationData>,
    hooks: HookRegistry<VerificationEvent>,
}

impl VerificationController {
    /// Build a controller for one pass.
    ///
    /// `verification_data` is the accumulated data of earlier passes,
    /// aligned one-to-one with the plan's verification list; pass an empty
    /// vector to start fresh. A size mismatch is a configuration error.
    pub fn new(
        testplan: TestPlan,
        current_state: SystemState,
        verification_data: Vec<VerificationData>,
    ) -> Result<Self, VerificationError> {
        let verification_data = if verification_data.is_empty() {
            vec![VerificationData::default(); testplan.verification.len()]
        } else if verification_data.len() == testplan.verification.len() {
            verification_data
        } else {
            return Err(VerificationError::SizeMismatch);
        };

        Ok(Self {
            testplan,
            current_state,
            verification_data,
            hooks: HookRegistry::new(VERIFICATION_EVENTS),
        })
    }

    /// Register a hook listener for one of [`VERIFICATION_EVENTS`].
    pub fn register_hook(
        &mut self,
        event_name: &str,
        listener: Arc<dyn EventListener<VerificationEvent>>,
    ) -> Result<(), HookError> {
        self.hooks.register_hook(event_name, listener)
    }

    /// Register a closure as a hook listener.
    pub fn register_fn<F>(&mut self, event_name: &str, hook: F) -> Result<(), HookError>
    where
        F: Fn(&VerificationEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.register_fn(event_name, hook)
    }

    /// Execute every applicable plugin in plan order.
    ///
    /// Returns true when every strict plugin that ran passed (vacuously true
    /// when none did).
    pub async fn execute(&mut self) -> Result<bool, VerificationError> {
        self.hooks.emit(&VerificationEvent::Start)?;

        let mut verify_list = Vec::new();
        for index in 0..self.testplan.verification.len() {
            let config = self.testplan.verification[index].clone();
            tokio::time::sleep(Duration::from_millis(config.delay_before)).await;

            if config.states.contains(&self.current_state) {
                let plugin_type = config.spec.verification_type();
                info!(plugin = %plugin_type, "starting verification");

                let Some(plugin) = plugins::build_plugin(
                    &config.spec,
                    &self.verification_data[index],
                    self.current_state,
                ) else {
                    // A plugin can be in the schema before it is ready for
                    // usage; skip it and tell the listeners.
                    self.hooks
                        .emit(&VerificationEvent::PluginNotFound { index, plugin_type })?;
                    continue;
                };

                self.hooks
                    .emit(&VerificationEvent::PluginStart { index, plugin_type })?;
                let state_data = plugin.run_verification().await;
                info!(plugin = %plugin_type, rc = state_data.rc, "completed verification");
                self.hooks.emit(&VerificationEvent::PluginEnd {
                    index,
                    plugin_type,
                    state_data: state_data.clone(),
                })?;

                self.verification_data[index].replace_data(self.current_state, state_data.clone());
                if config.strict {
                    verify_list.push(state_data.rc == 0);
                }
            } else {
                self.verification_data[index].add_data(self.current_state, None);
            }

            tokio::time::sleep(Duration::from_millis(config.delay_after)).await;
        }

        self.hooks.emit(&VerificationEvent::End {
            results: verify_list.clone(),
        })?;
        Ok(verify_list.iter().all(|passed| *passed))
    }

    /// The accumulated verification data, in plan order.
    pub fn verification_data(&self) -> &[VerificationData] {
        &self.verification_data
    }

    /// Consume the controller, handing the accumulated data to the caller
    /// for the next pass.
    pub fn into_verification_data(self) -> Vec<VerificationData> {
        self.verification_data
    }

    /// The accumulated data encoded as a JSON array, one entry per plugin.
    pub fn dump_verification_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.verification_data)
    }

    /// The accumulated data encoded as a YAML array, one entry per plugin.
    pub fn dump_verification_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.verification_data)
    }
}
