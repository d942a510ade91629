//! Time-series-metric plugin: queries a metrics endpoint once and evaluates
//! the configured criteria against every returned series.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use ychaos_core::testplan::metrics::{MetricsComparator, MetricsError, StateBoundMetricsCriteria};
use ychaos_core::testplan::verification::{TsdbVerification, VerificationType};
use ychaos_core::testplan::SystemState;

use crate::data::{VerificationData, VerificationStateData};

use super::VerificationPlugin;

/// One series of a metrics query response: a name plus a dense
/// time-to-value map keyed by POSIX seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TsdbSeries {
    /// The metric name.
    #[serde(default)]
    pub metric: String,
    /// The datapoints.
    #[serde(default)]
    pub dps: BTreeMap<i64, f64>,
}

/// The time-series-metric plugin.
pub struct TsdbVerificationPlugin {
    config: TsdbVerification,
    state_data: VerificationData,
    current_state: SystemState,
}

impl TsdbVerificationPlugin {
    /// Build the plugin from its validated config, prior data and the
    /// current system state (needed by the state-bound criteria).
    pub fn new(
        config: TsdbVerification,
        state_data: VerificationData,
        current_state: SystemState,
    ) -> Self {
        Self {
            config,
            state_data,
            current_state,
        }
    }

    /// The stored prior-state value for a state-bound criterion: the same
    /// aggregator applied to the matching series recorded for the nearest
    /// earlier populated system state.
    fn prior_aggregate(
        &self,
        criteria: &StateBoundMetricsCriteria,
        metric: &str,
    ) -> Result<Option<f64>, MetricsError> {
        let earlier_states: Vec<SystemState> = SystemState::ALL
            .into_iter()
            .take_while(|state| *state != self.current_state)
            .collect();
        for state in earlier_states.into_iter().rev() {
            let Some(recorded) = self.state_data.get_data(state) else {
                continue;
            };
            let Ok(series) = serde_json::from_value::<Vec<TsdbSeries>>(recorded.data.clone())
            else {
                continue;
            };
            if let Some(matching) = series.iter().find(|series| series.metric == metric) {
                return criteria.aggregator.aggregate(&matching.dps);
            }
        }
        Ok(None)
    }

    /// Evaluate every criterion over every series. 0 means all passed,
    /// 1 means some criterion failed.
    fn validate_criteria(&self, response: &[TsdbSeries]) -> Result<i32, MetricsError> {
        for series in response {
            for criteria in &self.config.criteria {
                if !criteria.passes(&series.dps)? {
                    return Ok(1);
                }
            }

            for criteria in &self.config.state_bound_criteria {
                let Some(condition) = criteria.condition_for(self.current_state) else {
                    continue;
                };
                let aggregated = criteria.aggregator.aggregate(&series.dps)?;
                let prior = if condition.comparator == MetricsComparator::PctChange {
                    let value = self.prior_aggregate(criteria, &series.metric)?;
                    if value.is_none() {
                        return Err(MetricsError::MissingPriorValue);
                    }
                    value
                } else {
                    None
                };
                if !condition.holds_with_prior(aggregated, prior)? {
                    return Ok(1);
                }
            }
        }
        Ok(0)
    }

    fn build_request(&self, session: &reqwest::Client) -> reqwest::RequestBuilder {
        let method = match self.config.method.as_str() {
            "POST" => reqwest::Method::POST,
            _ => reqwest::Method::GET,
        };
        let request = session.request(method, self.config.url.clone());
        if self.config.query.is_null() {
            request
        } else {
            request.json(&self.config.query)
        }
    }
}

#[async_trait]
impl VerificationPlugin for TsdbVerificationPlugin {
    fn plugin_type(&self) -> VerificationType {
        VerificationType::Tsdb
    }

    async fn run_verification(&self) -> VerificationStateData {
        info!(url = %self.config.url, "running tsdb verification");

        let session = match reqwest::Client::builder()
            .timeout(Duration::from_millis(self.config.timeout))
            .build()
        {
            Ok(session) => session,
            Err(error) => {
                return VerificationStateData::new(
                    -1,
                    self.plugin_type(),
                    serde_json::json!({"error": error.to_string()}),
                );
            }
        };

        let response = match self.build_request(&session).send().await {
            Ok(response) => response,
            Err(error) => {
                return VerificationStateData::new(
                    -1,
                    self.plugin_type(),
                    serde_json::json!({"url": self.config.url.as_str(), "error": error.to_string()}),
                );
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return VerificationStateData::new(
                -1,
                self.plugin_type(),
                serde_json::json!({
                    "url": self.config.url.as_str(),
                    "status_code": status.as_u16(),
                    "data": {},
                }),
            );
        }

        let payload: serde_json::Value = match response.json().await {
            Ok(payload) => payload,
            Err(error) => {
                return VerificationStateData::new(
                    -1,
                    self.plugin_type(),
                    serde_json::json!({"url": self.config.url.as_str(), "error": error.to_string()}),
                );
            }
        };

        let series: Vec<TsdbSeries> = match serde_json::from_value(payload.clone()) {
            Ok(series) => series,
            Err(error) => {
                return VerificationStateData::new(
                    -1,
                    self.plugin_type(),
                    serde_json::json!({"url": self.config.url.as_str(), "error": error.to_string()}),
                );
            }
        };

        match self.validate_criteria(&series) {
            Ok(rc) => VerificationStateData::new(rc, self.plugin_type(), payload),
            Err(error) => VerificationStateData::new(
                -1,
                self.plugin_type(),
                serde_json::json!({"error": error.to_string(), "response": payload}),
            ),
        }
    }
}
