//! End-to-end verification passes through the controller, using the script
//! plugin against real temp scripts.

use std::io::Write;
use std::path::PathBuf;

use ychaos_core::testplan::{SystemState, TestPlan};
use ychaos_verification::{VerificationController, VerificationEvent};

fn script_file(body: &str) -> PathBuf {
    let mut file = tempfile::NamedTempFile::with_suffix(".sh").expect("tempfile");
    writeln!(file, "{body}").expect("write");
    let (_, path) = file.keep().expect("keep");
    path
}

fn plan_with_script(states: &str, strict: bool, script: &PathBuf) -> TestPlan {
    TestPlan::from_yaml(&format!(
        r#"
verification:
  - states: {states}
    strict: {strict}
    type: script
    config:
      path: {}
      executable: /bin/sh
attack:
  target_type: self
  target_config: {{}}
  agents:
    - type: no_op
"#,
        script.display()
    ))
    .expect("plan")
}

/// A strict-false verification that fails cannot fail the overall outcome,
/// but its state data is recorded with the failing return code.
#[tokio::test]
async fn strict_false_verification_cannot_fail_the_overall() {
    let script = script_file("exit 1");
    let plan = plan_with_script("STEADY", false, &script);
    let mut controller =
        VerificationController::new(plan, SystemState::Steady, Vec::new()).expect("controller");

    let verified = controller.execute().await.expect("execute");
    assert!(verified);

    let state_data = controller.verification_data()[0]
        .get_data(SystemState::Steady)
        .expect("populated");
    assert_eq!(state_data.rc, 1);
}

/// The same failing plugin with strict gating flips the overall outcome.
#[tokio::test]
async fn strict_failure_fails_the_overall() {
    let script = script_file("exit 1");
    let plan = plan_with_script("STEADY", true, &script);
    let mut controller =
        VerificationController::new(plan, SystemState::Steady, Vec::new()).expect("controller");

    let verified = controller.execute().await.expect("execute");
    assert!(!verified);
}

/// Data accumulated in one pass carries into the next: the STEADY record
/// survives a CHAOS pass in which the plugin does not apply.
#[tokio::test]
async fn verification_data_persists_across_passes() {
    let script = script_file("exit 0");
    let plan = plan_with_script("[STEADY]", true, &script);

    let mut steady_pass =
        VerificationController::new(plan.clone(), SystemState::Steady, Vec::new())
            .expect("controller");
    assert!(steady_pass.execute().await.expect("execute"));
    let carried = steady_pass.into_verification_data();
    assert!(carried[0].is_data_present(SystemState::Steady));

    let mut chaos_pass =
        VerificationController::new(plan, SystemState::Chaos, carried).expect("controller");
    assert!(chaos_pass.execute().await.expect("execute"));

    let data = &chaos_pass.verification_data()[0];
    assert!(data.is_data_present(SystemState::Steady));
    assert!(!data.is_data_present(SystemState::Chaos));
}

/// Plugin start/end hooks fire with the plan index, and the end hook carries
/// the strict pass list.
#[tokio::test]
async fn hooks_observe_the_pass() {
    let script = script_file("exit 0");
    let plan = plan_with_script("STEADY", true, &script);
    let mut controller =
        VerificationController::new(plan, SystemState::Steady, Vec::new()).expect("controller");

    let observed: std::sync::Arc<std::sync::Mutex<Vec<String>>> =
        std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    for event_name in ["on_start", "on_each_plugin_start", "on_each_plugin_end", "on_end"] {
        let observed = std::sync::Arc::clone(&observed);
        controller
            .register_fn(event_name, move |event| {
                if let VerificationEvent::End { results } = event {
                    assert_eq!(results, &vec![true]);
                }
                observed.lock().expect("lock").push(event_name.to_string());
                Ok(())
            })
            .expect("register");
    }

    controller.execute().await.expect("execute");
    assert_eq!(
        *observed.lock().expect("lock"),
        vec!["on_start", "on_each_plugin_start", "on_each_plugin_end", "on_end"]
    );
}

/// JSON and YAML dumps of the same pass are semantically identical.
#[tokio::test]
async fn dumps_agree_across_encodings() {
    let script = script_file("exit 0");
    let plan = plan_with_script("STEADY", true, &script);
    let mut controller =
        VerificationController::new(plan, SystemState::Steady, Vec::new()).expect("controller");
    controller.execute().await.expect("execute");

    let from_json: serde_json::Value =
        serde_json::from_str(&controller.dump_verification_json().expect("json")).expect("parse");
    let from_yaml: serde_json::Value =
        serde_yaml::from_str(&controller.dump_verification_yaml().expect("yaml")).expect("parse");
    assert_eq!(from_json, from_yaml);

    let entries = from_json.as_array().expect("array");
    assert_eq!(entries.len(), 1);
    assert!(entries[0]["STEADY"]["timestamp"].is_i64());
    assert!(entries[0]["CHAOS"].is_null());
}
