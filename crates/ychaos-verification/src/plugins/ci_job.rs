//! CI-job plugin: triggers a job in a CI pipeline and tracks the resulting
//! build to a terminal status.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use ychaos_core::testplan::verification::{CiJobVerification, VerificationType};

use crate::data::{VerificationData, VerificationStateData};

use super::VerificationPlugin;

/// Statuses that end the build unsuccessfully.
const FAILED_STATUSES: [&str; 5] = ["ABORTED", "FAILURE", "BLOCKED", "UNSTABLE", "FROZEN"];

/// Seconds between build status polls.
const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period after the event post, giving the CI service time to
/// materialize the build.
const START_GRACE: Duration = Duration::from_secs(2);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
enum CiJobError {
    #[error("CI API returned {status} for {url}")]
    Http {
        url: String,
        status: u16,
        body: serde_json::Value,
    },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("job did not reach a terminal status within {0} seconds")]
    JobTimeout(u64),
}

/// The CI-job plugin.
pub struct CiJobVerificationPlugin {
    config: CiJobVerification,
    #[allow(dead_code)]
    state_data: VerificationData,
}

impl CiJobVerificationPlugin {
    /// Build the plugin from its validated config and prior data.
    pub fn new(config: CiJobVerification, state_data: VerificationData) -> Self {
        Self { config, state_data }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.api_url.as_str().trim_end_matches('/'))
    }

    async fn json_or_error(response: reqwest::Response) -> Result<serde_json::Value, CiJobError> {
        let status = response.status();
        let url = response.url().to_string();
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        if status.is_success() {
            Ok(body)
        } else {
            Err(CiJobError::Http {
                url,
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn fetch_bearer_token(&self, session: &reqwest::Client) -> Result<String, CiJobError> {
        let api_token = self.config.api_token.resolve().unwrap_or_default();
        let response = session
            .get(self.endpoint("v4/auth/token"))
            .query(&[("api_token", api_token)])
            .send()
            .await?;
        let body = Self::json_or_error(response).await?;
        Ok(body
            .get("token")
            .and_then(|token| token.as_str())
            .unwrap_or_default()
            .to_string())
    }

    async fn start_job(
        &self,
        session: &reqwest::Client,
        bearer_token: &str,
    ) -> Result<serde_json::Value, CiJobError> {
        let response = session
            .post(self.endpoint("v4/events"))
            .header("Authorization", bearer_token)
            .json(&serde_json::json!({
                "causeMessage": "YChaos CI job verification",
                "creator": {"name": "ychaos", "username": "ychaos"},
                "pipelineId": self.config.pipeline_id,
                "startFrom": self.config.job_name,
            }))
            .send()
            .await?;
        Self::json_or_error(response).await
    }

    fn build_outcome(&self, build: &serde_json::Value, status: &str) -> VerificationStateData {
        let rc = if status == "SUCCESS" { 0 } else { 2 };
        VerificationStateData::new(
            rc,
            self.plugin_type(),
            serde_json::json!({
                "event_id": build.get("eventId"),
                "status": status,
                "status_message": build.get("statusMessage"),
                "job_id": build.get("jobId"),
            }),
        )
    }

    /// Poll the event's builds at the fixed cadence until a terminal status
    /// or the configured job timeout.
    async fn monitor_job(
        &self,
        session: &reqwest::Client,
        bearer_token: &str,
        event: &serde_json::Value,
    ) -> Result<VerificationStateData, CiJobError> {
        let event_id = event.get("id").and_then(serde_json::Value::as_u64).unwrap_or_default();
        let deadline = Utc::now() + chrono::Duration::seconds(self.config.job_timeout as i64);
        info!(
            pipeline_id = self.config.pipeline_id,
            job_name = %self.config.job_name,
            event_id,
            "monitoring CI job"
        );

        while Utc::now() < deadline {
            let response = session
                .get(self.endpoint(&format!("v4/events/{event_id}/builds")))
                .header("Authorization", bearer_token)
                .send()
                .await?;
            let builds = Self::json_or_error(response).await?;
            let build = builds.get(0).cloned().unwrap_or_default();
            let status = build
                .get("status")
                .and_then(|status| status.as_str())
                .unwrap_or_default()
                .to_string();

            if status == "SUCCESS" {
                info!(status = %status, "CI job verification successful");
                return Ok(self.build_outcome(&build, &status));
            }
            if FAILED_STATUSES.contains(&status.as_str()) {
                info!(status = %status, "CI job verification failed");
                return Ok(self.build_outcome(&build, &status));
            }
            // Status is CREATED/QUEUED/RUNNING: wait for the next poll.
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Err(CiJobError::JobTimeout(self.config.job_timeout))
    }

    async fn trigger_and_track(&self) -> Result<VerificationStateData, CiJobError> {
        let session = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let bearer_token = self.fetch_bearer_token(&session).await?;
        info!(
            pipeline_id = self.config.pipeline_id,
            job_name = %self.config.job_name,
            "starting CI job"
        );
        let event = self.start_job(&session, &bearer_token).await?;
        tokio::time::sleep(START_GRACE).await;
        self.monitor_job(&session, &bearer_token, &event).await
    }
}

#[async_trait]
impl VerificationPlugin for CiJobVerificationPlugin {
    fn plugin_type(&self) -> VerificationType {
        VerificationType::CiJob
    }

    async fn run_verification(&self) -> VerificationStateData {
        match self.trigger_and_track().await {
            Ok(state_data) => state_data,
            Err(CiJobError::Http { url, status, body }) => VerificationStateData::new(
                1,
                self.plugin_type(),
                serde_json::json!({
                    "url": url,
                    "status_code": status,
                    "json": body,
                    "error": "HTTPError",
                }),
            ),
            Err(error @ CiJobError::Transport(_)) => VerificationStateData::new(
                1,
                self.plugin_type(),
                serde_json::json!({"error": "Timeout", "error_desc": error.to_string()}),
            ),
            Err(error @ CiJobError::JobTimeout(_)) => VerificationStateData::new(
                1,
                self.plugin_type(),
                serde_json::json!({"error": "JobTimeout", "error_desc": error.to_string()}),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::Json;

    async fn fake_ci(final_status: &'static str) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let address = listener.local_addr().expect("addr");
        let app = axum::Router::new()
            .route(
                "/v4/auth/token",
                get(|| async { Json(serde_json::json!({"token": "jwt-token"})) }),
            )
            .route(
                "/v4/events",
                post(|| async { Json(serde_json::json!({"id": 991})) }),
            )
            .route(
                "/v4/events/{id}/builds",
                get(move || async move {
                    Json(serde_json::json!([
                        {"eventId": 991, "jobId": 17, "status": final_status}
                    ]))
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        address
    }

    fn plugin_for(address: std::net::SocketAddr) -> CiJobVerificationPlugin {
        let config: CiJobVerification = serde_json::from_value(serde_json::json!({
            "pipeline_id": 123456,
            "job_name": "state_verification",
            "api_url": format!("http://{address}"),
            "api_token": "pipeline-token",
            "job_timeout": 120,
        }))
        .expect("config");
        CiJobVerificationPlugin::new(config, VerificationData::default())
    }

    #[tokio::test]
    async fn successful_build_yields_code_zero() {
        let address = fake_ci("SUCCESS").await;
        let state_data = plugin_for(address).run_verification().await;
        assert_eq!(state_data.rc, 0);
        assert_eq!(state_data.data["status"], "SUCCESS");
        assert_eq!(state_data.data["job_id"], 17);
    }

    #[tokio::test]
    async fn failed_build_yields_code_two() {
        let address = fake_ci("FAILURE").await;
        let state_data = plugin_for(address).run_verification().await;
        assert_eq!(state_data.rc, 2);
        assert_eq!(state_data.data["status"], "FAILURE");
    }

    #[tokio::test]
    async fn http_errors_yield_code_one() {
        // Nothing is listening here.
        let config: CiJobVerification = serde_json::from_value(serde_json::json!({
            "pipeline_id": 123456,
            "job_name": "state_verification",
            "api_url": "http://127.0.0.1:9",
            "api_token": "pipeline-token",
        }))
        .expect("config");
        let plugin = CiJobVerificationPlugin::new(config, VerificationData::default());
        let state_data = plugin.run_verification().await;
        assert_eq!(state_data.rc, 1);
    }
}
