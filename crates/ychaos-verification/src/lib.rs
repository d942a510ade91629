//! YChaos Verification
//!
//! The verification half of the YChaos resilience testing framework: probe
//! plugins (script runner, HTTP probe, time-series metrics, CI job) and the
//! controller that runs them in plan order against a labelled system state,
//! accumulating per-state verification data across engine runs.

pub mod controller;
pub mod data;
pub mod plugins;

pub use controller::{
    VerificationController, VerificationError, VerificationEvent, VERIFICATION_EVENTS,
};
pub use data::{VerificationData, VerificationStateData};
pub use plugins::VerificationPlugin;
