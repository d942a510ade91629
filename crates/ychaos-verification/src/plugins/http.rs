//! HTTP-probe plugin: requests each configured URL `count` times and records
//! a failure datapoint for unexpected status codes, excessive latency, and
//! transport errors.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::Serialize;
use tracing::info;

use ychaos_core::testplan::verification::{HttpRequestVerification, VerificationType};

use crate::data::{VerificationData, VerificationStateData};

use super::VerificationPlugin;

/// One failing observation of the probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpProbeFailure {
    /// The URL that was probed.
    pub url: String,
    /// Response status, when a response arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Response latency in milliseconds, when a response arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<u64>,
    /// Transport error class, when no response arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Transport error description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_desc: Option<String>,
}

/// Judge one response against the expected status set and latency bound.
/// A failing response yields the datapoint to record; `None` is a pass.
pub fn evaluate_response(
    config: &HttpRequestVerification,
    url: &str,
    status_code: u16,
    latency_ms: u64,
) -> Option<HttpProbeFailure> {
    if config.status_codes.contains(&status_code) && latency_ms <= config.latency {
        return None;
    }
    Some(HttpProbeFailure {
        url: url.to_string(),
        status_code: Some(status_code),
        latency: Some(latency_ms),
        error: None,
        error_desc: None,
    })
}

fn classify_transport_error(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        "Timeout"
    } else if error.is_connect() {
        "ConnectionError"
    } else if error.is_decode() {
        "DecodeError"
    } else {
        "RequestError"
    }
}

/// The HTTP-probe plugin.
pub struct HttpRequestVerificationPlugin {
    config: HttpRequestVerification,
    #[allow(dead_code)]
    state_data: VerificationData,
}

impl HttpRequestVerificationPlugin {
    /// Build the plugin from its validated config and prior data.
    pub fn new(config: HttpRequestVerification, state_data: VerificationData) -> Self {
        Self { config, state_data }
    }

    /// Build the reusable session: merged headers, TLS-verify flag, bearer
    /// token, optional client certificate and the request timeout.
    fn build_session(&self) -> anyhow::Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.config.headers {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(&value.resolve()?)?,
            );
        }
        if let Some(token) = &self.config.bearer_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.resolve()?))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(self.config.timeout));
        if !self.config.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some((certificate, key)) = &self.config.cert {
            let mut pem = std::fs::read(certificate)?;
            pem.extend(std::fs::read(key)?);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }
        Ok(builder.build()?)
    }

    fn method(&self) -> reqwest::Method {
        match self.config.method.as_str() {
            "POST" => reqwest::Method::POST,
            "HEAD" => reqwest::Method::HEAD,
            "PATCH" => reqwest::Method::PATCH,
            "DELETE" => reqwest::Method::DELETE,
            _ => reqwest::Method::GET,
        }
    }

    async fn probe_once(
        &self,
        session: &reqwest::Client,
        url: &reqwest::Url,
    ) -> Option<HttpProbeFailure> {
        let mut request = session
            .request(self.method(), url.clone())
            .query(&self.config.params);
        if let Some((user, password)) = &self.config.basic_auth {
            request = request.basic_auth(user, password.resolve().ok());
        }

        let started = Instant::now();
        match request.send().await {
            Ok(response) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                evaluate_response(
                    &self.config,
                    response.url().as_str(),
                    response.status().as_u16(),
                    latency_ms,
                )
            }
            Err(error) => Some(HttpProbeFailure {
                url: url.as_str().to_string(),
                status_code: None,
                latency: None,
                error: Some(classify_transport_error(&error).to_string()),
                error_desc: Some(error.to_string()),
            }),
        }
    }
}

#[async_trait]
impl VerificationPlugin for HttpRequestVerificationPlugin {
    fn plugin_type(&self) -> VerificationType {
        VerificationType::HttpRequest
    }

    /// The payload is a list per iteration of the failing datapoints of that
    /// iteration; any failure anywhere fails the plugin with code 1.
    async fn run_verification(&self) -> VerificationStateData {
        let session = match self.build_session() {
            Ok(session) => session,
            Err(error) => {
                return VerificationStateData::new(
                    -1,
                    self.plugin_type(),
                    serde_json::json!({"error": error.to_string()}),
                );
            }
        };

        let mut rc = 0;
        let mut iterations = Vec::with_capacity(self.config.count as usize);
        for _ in 0..self.config.count {
            let mut failures = Vec::new();
            for url in &self.config.urls {
                if let Some(failure) = self.probe_once(&session, url).await {
                    rc = 1;
                    failures.push(failure);
                }
            }
            iterations.push(failures);
        }

        info!(rc, "http request verification finished");
        VerificationStateData::new(
            rc,
            self.plugin_type(),
            serde_json::to_value(iterations).unwrap_or_default(),
        )
    }
}
