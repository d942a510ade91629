//! The verification half of a test plan: per-plugin configuration plus the
//! shared gating fields (applicable states, strictness, delays).

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::secrets::SecretValue;
use crate::{PlanError, Result};

use super::metrics::{MetricsCriteria, StateBoundMetricsCriteria};
use super::SystemState;

/// HTTP methods accepted by the probing plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// GET request.
    #[default]
    Get,
    /// POST request.
    Post,
    /// HEAD request.
    Head,
    /// PATCH request.
    Patch,
    /// DELETE request.
    Delete,
}

impl HttpMethod {
    /// The method as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Head => "HEAD",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// The closed set of verification plugin kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationType {
    /// Runs an external script and propagates its exit code.
    Script,
    /// Probes HTTP endpoints for status and latency.
    HttpRequest,
    /// Queries a time-series database and evaluates metrics criteria.
    Tsdb,
    /// Triggers a CI job and tracks it to a terminal status.
    CiJob,
    /// Reserved for testing the plugin-not-found path.
    Noop,
}

impl VerificationType {
    /// The wire tag of this plugin kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::HttpRequest => "http_request",
            Self::Tsdb => "tsdb",
            Self::CiJob => "ci_job",
            Self::Noop => "noop",
        }
    }
}

impl std::fmt::Display for VerificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of the script-runner plugin.
///
/// The user of this plugin takes full responsibility for the script executed;
/// the framework only runs it and collects the exit code with which the state
/// of the system is verified.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptVerification {
    /// Absolute path of the script.
    pub path: PathBuf,
    /// Interpreter used to execute the script.
    #[serde(default = "default_interpreter")]
    pub executable: String,
    /// Positional arguments passed to the script.
    #[serde(default)]
    pub arguments: Vec<String>,
}

fn default_interpreter() -> String {
    "/bin/sh".to_string()
}

impl ScriptVerification {
    /// The arguments, shell-escaped.
    pub fn safe_arguments(&self) -> Vec<String> {
        self.arguments
            .iter()
            .map(|argument| {
                shlex::try_quote(argument)
                    .map(Cow::into_owned)
                    .unwrap_or_else(|_| argument.clone())
            })
            .collect()
    }
}

/// Configuration of the HTTP-probe plugin.
///
/// Requests each URL `count` times and records a failure datapoint for any
/// response outside the expected status set, any response slower than
/// `latency` milliseconds, and any transport error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpRequestVerification {
    /// Number of calls sent to each URL.
    #[serde(default = "default_count")]
    pub count: u32,
    /// Expected latency in milliseconds; anything above fails the datapoint.
    #[serde(default = "default_latency")]
    pub latency: u64,
    /// The status codes considered successful.
    #[serde(default = "default_status_codes")]
    pub status_codes: Vec<u16>,
    /// URLs to request.
    #[serde(default)]
    pub urls: Vec<Url>,
    /// HTTP method to use.
    #[serde(default)]
    pub method: HttpMethod,
    /// Headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, SecretValue>,
    /// Query parameters sent with every request.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Verify the target's TLS certificates.
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Basic-auth credentials.
    #[serde(default)]
    pub basic_auth: Option<(String, SecretValue)>,
    /// Bearer token.
    #[serde(default)]
    pub bearer_token: Option<SecretValue>,
    /// Client certificate and key file paths, PEM encoded.
    #[serde(default)]
    pub cert: Option<(PathBuf, PathBuf)>,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
}

fn default_count() -> u32 {
    1
}

fn default_latency() -> u64 {
    50
}

fn default_status_codes() -> Vec<u16> {
    (200..300).collect()
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl HttpRequestVerification {
    fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(PlanError::Invalid("http_request count must be >= 1".into()));
        }
        if self.latency == 0 {
            return Err(PlanError::Invalid("http_request latency must be >= 1".into()));
        }
        Ok(())
    }
}

/// Configuration of the time-series-metric plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TsdbVerification {
    /// The metrics endpoint to query.
    pub url: Url,
    /// HTTP method used for the query.
    #[serde(default)]
    pub method: HttpMethod,
    /// The query document sent to the endpoint.
    #[serde(default)]
    pub query: serde_json::Value,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
    /// Stateless criteria; all of them must pass on every series.
    #[serde(default)]
    pub criteria: Vec<MetricsCriteria>,
    /// State-bound criteria; all of them must pass on every series.
    #[serde(default)]
    pub state_bound_criteria: Vec<StateBoundMetricsCriteria>,
}

impl TsdbVerification {
    fn validate(&self) -> Result<()> {
        if self.criteria.is_empty() && self.state_bound_criteria.is_empty() {
            return Err(PlanError::Invalid(
                "tsdb verification needs criteria or state_bound_criteria".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration of the CI-job plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CiJobVerification {
    /// The CI pipeline identifier.
    pub pipeline_id: u64,
    /// Job name within the pipeline.
    pub job_name: String,
    /// The CI service API URL.
    pub api_url: Url,
    /// Access token able to start the job in the pipeline.
    pub api_token: SecretValue,
    /// Seconds to wait for the job to reach a terminal status.
    #[serde(default = "default_job_timeout")]
    pub job_timeout: u64,
}

fn default_job_timeout() -> u64 {
    3600
}

/// Configuration of the reserved no-op plugin. Testing only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoopVerification {}

/// The tagged per-plugin configuration subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum VerificationSpec {
    /// Script-runner plugin config.
    Script(ScriptVerification),
    /// HTTP-probe plugin config.
    HttpRequest(HttpRequestVerification),
    /// Time-series-metric plugin config.
    Tsdb(TsdbVerification),
    /// CI-job plugin config.
    CiJob(CiJobVerification),
    /// Reserved no-op plugin config.
    Noop(NoopVerification),
}

impl VerificationSpec {
    /// The plugin kind this config belongs to.
    pub fn verification_type(&self) -> VerificationType {
        match self {
            Self::Script(_) => VerificationType::Script,
            Self::HttpRequest(_) => VerificationType::HttpRequest,
            Self::Tsdb(_) => VerificationType::Tsdb,
            Self::CiJob(_) => VerificationType::CiJob,
            Self::Noop(_) => VerificationType::Noop,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::HttpRequest(config) => config.validate(),
            Self::Tsdb(config) => config.validate(),
            Self::Script(_) | Self::CiJob(_) | Self::Noop(_) => Ok(()),
        }
    }
}

/// One verification entry of the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Delay in milliseconds before running this plugin.
    #[serde(default)]
    pub delay_before: u64,
    /// Delay in milliseconds after running this plugin.
    #[serde(default)]
    pub delay_after: u64,
    /// The system states in which this plugin applies. A single state is
    /// accepted and normalized to a one-element list.
    #[serde(deserialize_with = "one_or_many_states")]
    pub states: Vec<SystemState>,
    /// Whether a failure of this plugin fails the overall verification.
    #[serde(default = "default_true")]
    pub strict: bool,
    /// The plugin kind and its configuration.
    #[serde(flatten)]
    pub spec: VerificationSpec,
}

impl VerificationConfig {
    /// Enforce the per-plugin invariants the schema cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.states.is_empty() {
            return Err(PlanError::Invalid(
                "verification needs at least one applicable state".into(),
            ));
        }
        self.spec.validate()
    }
}

fn one_or_many_states<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<SystemState>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(SystemState),
        Many(Vec<SystemState>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(state) => vec![state],
        OneOrMany::Many(states) => states,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_state_normalizes_to_a_list() {
        let config: VerificationConfig = serde_yaml::from_str(
            r#"
states: STEADY
type: noop
config: {}
"#,
        )
        .expect("parse");
        assert_eq!(config.states, vec![SystemState::Steady]);
        assert!(config.strict);
    }

    #[test]
    fn http_request_defaults_follow_the_schema() {
        let config: VerificationConfig = serde_yaml::from_str(
            r#"
states: [STEADY, RECOVERED]
type: http_request
config:
  urls: ["https://example.com/health"]
"#,
        )
        .expect("parse");
        let VerificationSpec::HttpRequest(http) = &config.spec else {
            panic!("expected http_request spec");
        };
        assert_eq!(http.count, 1);
        assert_eq!(http.latency, 50);
        assert_eq!(http.timeout, 10_000);
        assert!(http.status_codes.contains(&200) && !http.status_codes.contains(&300));
        assert_eq!(config.spec.verification_type(), VerificationType::HttpRequest);
    }

    #[test]
    fn unknown_config_keys_are_schema_violations() {
        let parsed: std::result::Result<VerificationConfig, _> = serde_yaml::from_str(
            r#"
states: STEADY
type: script
config:
  path: /tmp/probe.sh
  interpreter_typo: /bin/bash
"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn tsdb_needs_at_least_one_criteria_family() {
        let config: VerificationConfig = serde_yaml::from_str(
            r#"
states: CHAOS
type: tsdb
config:
  url: "https://tsdb.example.com/api/query"
"#,
        )
        .expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn script_arguments_are_shell_escaped() {
        let script = ScriptVerification {
            path: PathBuf::from("/tmp/probe.sh"),
            executable: default_interpreter(),
            arguments: vec!["plain".into(), "two words".into()],
        };
        assert_eq!(script.safe_arguments(), vec!["plain", "'two words'"]);
    }

    #[test]
    fn secret_headers_never_serialize_in_the_clear() {
        let config: HttpRequestVerification = serde_yaml::from_str(
            r#"
urls: ["https://example.com"]
headers:
  X-Api-Key: super-secret-key
bearer_token: {type: env, id: TOKEN_VAR}
"#,
        )
        .expect("parse");
        let dumped = serde_yaml::to_string(&config).expect("dump");
        assert!(!dumped.contains("super-secret-key"));
        assert!(dumped.contains("TOKEN_VAR"));
    }
}
