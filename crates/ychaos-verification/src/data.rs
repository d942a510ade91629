//! Verification data records: one state datapoint per plugin invocation,
//! accumulated per system state across engine runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use ychaos_core::testplan::verification::VerificationType;
use ychaos_core::testplan::SystemState;

/// The outcome of one plugin invocation.
///
/// `rc` follows the plugin convention: 0 success, positive failure, negative
/// plugin error. Timestamps serialize as integer POSIX seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationStateData {
    /// Return code of the plugin.
    pub rc: i32,
    /// When this state data was recorded.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    /// The plugin that recorded this state data.
    #[serde(rename = "type")]
    pub plugin_type: VerificationType,
    /// Plugin-level payload, a free-form map or list.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl VerificationStateData {
    /// State data recorded now.
    pub fn new(rc: i32, plugin_type: VerificationType, data: serde_json::Value) -> Self {
        Self {
            rc,
            timestamp: Utc::now(),
            plugin_type,
            data,
        }
    }
}

/// Per-plugin verification data across one or more engine runs: a record or
/// null for every system state, null meaning "this plugin did not apply".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct VerificationData(BTreeMap<SystemState, Option<VerificationStateData>>);

impl Default for VerificationData {
    fn default() -> Self {
        Self(
            SystemState::ALL
                .into_iter()
                .map(|state| (state, None))
                .collect(),
        )
    }
}

impl<'de> Deserialize<'de> for VerificationData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut entries: BTreeMap<SystemState, Option<VerificationStateData>> =
            BTreeMap::deserialize(deserializer)?;
        for state in SystemState::ALL {
            entries.entry(state).or_insert(None);
        }
        Ok(Self(entries))
    }
}

impl VerificationData {
    /// Record `state_data` for `state` only when nothing is recorded yet.
    pub fn add_data(&mut self, state: SystemState, state_data: Option<VerificationStateData>) {
        let slot = self.0.entry(state).or_insert(None);
        if slot.is_none() {
            *slot = state_data;
        }
    }

    /// Record `state_data` for `state`, replacing whatever was there.
    pub fn replace_data(&mut self, state: SystemState, state_data: VerificationStateData) {
        self.0.insert(state, Some(state_data));
    }

    /// The record for `state`, if the plugin applied there.
    pub fn get_data(&self, state: SystemState) -> Option<&VerificationStateData> {
        self.0.get(&state).and_then(Option::as_ref)
    }

    /// Whether a record exists for `state`.
    pub fn is_data_present(&self, state: SystemState) -> bool {
        self.get_data(state).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_data_holds_null_for_every_state() {
        let data = VerificationData::default();
        for state in SystemState::ALL {
            assert!(!data.is_data_present(state));
        }
    }

    #[test]
    fn add_data_never_clobbers_an_existing_record() {
        let mut data = VerificationData::default();
        let first = VerificationStateData::new(0, VerificationType::Noop, serde_json::json!({}));
        data.replace_data(SystemState::Steady, first.clone());

        data.add_data(SystemState::Steady, None);
        assert_eq!(data.get_data(SystemState::Steady), Some(&first));

        data.replace_data(
            SystemState::Steady,
            VerificationStateData::new(1, VerificationType::Noop, serde_json::json!({})),
        );
        assert_eq!(data.get_data(SystemState::Steady).map(|d| d.rc), Some(1));
    }

    #[test]
    fn timestamps_serialize_as_posix_seconds() {
        let mut data = VerificationData::default();
        data.replace_data(
            SystemState::Chaos,
            VerificationStateData::new(0, VerificationType::HttpRequest, serde_json::json!([])),
        );
        let document = serde_json::to_value(&data).expect("serialize");
        let timestamp = &document["CHAOS"]["timestamp"];
        assert!(timestamp.is_i64());
        assert!(document["STEADY"].is_null());
    }

    #[test]
    fn json_and_yaml_encodings_are_equivalent() {
        let mut data = VerificationData::default();
        data.replace_data(
            SystemState::Steady,
            VerificationStateData::new(
                0,
                VerificationType::Script,
                serde_json::json!({"stdout": "ok"}),
            ),
        );

        let from_json: VerificationData =
            serde_json::from_str(&serde_json::to_string(&data).expect("json")).expect("parse");
        let from_yaml: VerificationData =
            serde_yaml::from_str(&serde_yaml::to_string(&data).expect("yaml")).expect("parse");
        assert_eq!(from_json, from_yaml);
        assert_eq!(from_json, data);
    }

    #[test]
    fn partial_dumps_parse_back_with_all_states() {
        let parsed: VerificationData =
            serde_json::from_str(r#"{"STEADY": null}"#).expect("parse");
        for state in SystemState::ALL {
            assert!(!parsed.is_data_present(state));
        }
    }
}
