//! Verification plugins.
//!
//! Every plugin shares one contract: given its validated config and the
//! accumulated prior data, `run_verification` returns a state datapoint.
//! Plugins never raise; transport and decoding failures are encoded as a
//! negative return code inside the datapoint.

pub mod ci_job;
pub mod http;
pub mod script;
pub mod tsdb;

use async_trait::async_trait;

use ychaos_core::testplan::verification::{VerificationSpec, VerificationType};
use ychaos_core::testplan::SystemState;

use crate::data::{VerificationData, VerificationStateData};

/// A single verification probe.
#[async_trait]
pub trait VerificationPlugin: Send + Sync {
    /// The plugin kind.
    fn plugin_type(&self) -> VerificationType;

    /// Run the probe and report the outcome as state data.
    async fn run_verification(&self) -> VerificationStateData;
}

/// Resolve the plugin for a verification config.
///
/// Returns `None` for tags recognised by the schema but not implemented
/// (the reserved `noop` plugin), which the controller reports through
/// `on_plugin_not_found`.
pub fn build_plugin(
    spec: &VerificationSpec,
    state_data: &VerificationData,
    current_state: SystemState,
) -> Option<Box<dyn VerificationPlugin>> {
    match spec {
        VerificationSpec::Script(config) => Some(Box::new(
            script::ScriptVerificationPlugin::new(config.clone(), state_data.clone()),
        )),
        VerificationSpec::HttpRequest(config) => Some(Box::new(
            http::HttpRequestVerificationPlugin::new(config.clone(), state_data.clone()),
        )),
        VerificationSpec::Tsdb(config) => Some(Box::new(tsdb::TsdbVerificationPlugin::new(
            config.clone(),
            state_data.clone(),
            current_state,
        ))),
        VerificationSpec::CiJob(config) => Some(Box::new(ci_job::CiJobVerificationPlugin::new(
            config.clone(),
            state_data.clone(),
        ))),
        VerificationSpec::Noop(_) => None,
    }
}
