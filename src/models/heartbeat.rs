//! Heartbeat request/response shapes exchanged with the control plane.
//!
//! The generator sections are kept as raw JSON so a malformed section can be
//! skipped without rejecting the whole heartbeat.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::CollectorInfo;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub timestamp: String,
    pub collector_config: CollectorInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub collector_config: Option<Map<String, Value>>,
    #[serde(default)]
    pub generators_added: Option<Value>,
    #[serde(default)]
    pub generators_updated: Option<Value>,
    #[serde(default)]
    pub generators_deleted: Option<Value>,
}

/// Entry of `generatorsDeleted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedGenerator {
    pub name: String,
}

impl HeartbeatResponse {
    /// Heartbeat timestamp rendered as the string used for secret derivation.
    pub fn timestamp_string(&self) -> Option<String> {
        match &self.timestamp {
            Some(Value::String(text)) => Some(text.clone()),
            Some(Value::Number(number)) => Some(number.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timestamp_string_accepts_numbers_and_strings() {
        let response: HeartbeatResponse =
            serde_json::from_value(json!({"timestamp": 1700000000000u64})).unwrap();
        assert_eq!(response.timestamp_string().as_deref(), Some("1700000000000"));

        let response: HeartbeatResponse =
            serde_json::from_value(json!({"timestamp": "2024-01-01T00:00:00Z"})).unwrap();
        assert_eq!(
            response.timestamp_string().as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_malformed_sections_still_parse() {
        let response: HeartbeatResponse = serde_json::from_value(json!({
            "generatorsAdded": "not-an-array",
            "generatorsDeleted": [{"name": "g1"}]
        }))
        .unwrap();
        assert_eq!(response.generators_added, Some(json!("not-an-array")));
        assert!(response.collector_config.is_none());
    }
}
