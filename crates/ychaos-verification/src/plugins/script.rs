//! Script-runner plugin: executes an external script as a child process and
//! propagates its exit code.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use ychaos_core::testplan::verification::{ScriptVerification, VerificationType};

use crate::data::{VerificationData, VerificationStateData};

use super::VerificationPlugin;

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the configured script under its interpreter with a fixed short
/// timeout. Stdout and stderr land in the state-data payload.
pub struct ScriptVerificationPlugin {
    config: ScriptVerification,
    #[allow(dead_code)]
    state_data: VerificationData,
}

impl ScriptVerificationPlugin {
    /// Build the plugin from its validated config and prior data.
    pub fn new(config: ScriptVerification, state_data: VerificationData) -> Self {
        Self { config, state_data }
    }

    /// The invocation rendered as a shell-safe command line, for the payload.
    fn rendered_command(&self) -> String {
        let mut rendered = vec![
            self.config.executable.clone(),
            self.config.path.display().to_string(),
        ];
        rendered.extend(self.config.safe_arguments());
        rendered.join(" ")
    }
}

#[async_trait]
impl VerificationPlugin for ScriptVerificationPlugin {
    fn plugin_type(&self) -> VerificationType {
        VerificationType::Script
    }

    async fn run_verification(&self) -> VerificationStateData {
        info!(script = %self.config.path.display(), "running script verification");

        let output = tokio::process::Command::new(&self.config.executable)
            .arg(&self.config.path)
            .args(&self.config.arguments)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(SCRIPT_TIMEOUT, output).await {
            Ok(Ok(output)) => VerificationStateData::new(
                output.status.code().unwrap_or(-1),
                self.plugin_type(),
                serde_json::json!({
                    "command": self.rendered_command(),
                    "stdout": String::from_utf8_lossy(&output.stdout),
                    "stderr": String::from_utf8_lossy(&output.stderr),
                }),
            ),
            Ok(Err(error)) => VerificationStateData::new(
                -1,
                self.plugin_type(),
                serde_json::json!({
                    "command": self.rendered_command(),
                    "error": error.to_string(),
                }),
            ),
            Err(_) => VerificationStateData::new(
                -1,
                self.plugin_type(),
                serde_json::json!({
                    "command": self.rendered_command(),
                    "error": format!("script timed out after {}s", SCRIPT_TIMEOUT.as_secs()),
                }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn plugin_for(script: &str, arguments: &[&str]) -> ScriptVerificationPlugin {
        let mut file = tempfile::NamedTempFile::with_suffix(".sh").expect("tempfile");
        writeln!(file, "{script}").expect("write");
        let (_, path) = file.keep().expect("keep");
        let config: ScriptVerification = serde_json::from_value(serde_json::json!({
            "path": path,
            "executable": "/bin/sh",
            "arguments": arguments,
        }))
        .expect("config");
        ScriptVerificationPlugin::new(config, VerificationData::default())
    }

    #[tokio::test]
    async fn exit_code_propagates() {
        let plugin = plugin_for("exit 3", &[]);
        let state_data = plugin.run_verification().await;
        assert_eq!(state_data.rc, 3);
    }

    #[tokio::test]
    async fn stdout_and_stderr_land_in_the_payload() {
        let plugin = plugin_for("echo out; echo err >&2", &[]);
        let state_data = plugin.run_verification().await;
        assert_eq!(state_data.rc, 0);
        assert_eq!(state_data.data["stdout"], "out\n");
        assert_eq!(state_data.data["stderr"], "err\n");
    }

    #[tokio::test]
    async fn arguments_reach_the_script() {
        let plugin = plugin_for(r#"test "$1" = "steady""#, &["steady"]);
        let state_data = plugin.run_verification().await;
        assert_eq!(state_data.rc, 0);
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_plugin_error() {
        let config: ScriptVerification = serde_json::from_value(serde_json::json!({
            "path": "/tmp/does-not-matter.sh",
            "executable": "/nonexistent/interpreter",
        }))
        .expect("config");
        let plugin = ScriptVerificationPlugin::new(config, VerificationData::default());
        let state_data = plugin.run_verification().await;
        assert_eq!(state_data.rc, -1);
    }
}
