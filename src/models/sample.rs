//! Sample model
//!
//! One `subject|aspect` measurement as accepted by the bulk upsert endpoint.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::CollectorError;

/// Value reported for samples synthesized from collection failures.
pub const ERROR_VALUE: &str = "ERROR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_value")]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_links: Option<Vec<Value>>,
}

impl Sample {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            message_code: None,
            message_body: None,
            related_links: None,
        }
    }

    /// Build an error sample for `subject|aspect` carrying `message`.
    pub fn error(subject_path: &str, aspect_name: &str, message: &str) -> Self {
        Self {
            name: format!("{}|{}", subject_path, aspect_name),
            value: ERROR_VALUE.to_string(),
            message_code: Some(ERROR_VALUE.to_string()),
            message_body: Some(message.to_string()),
            related_links: None,
        }
    }

    /// Convert a transform result element into a sample.
    pub fn from_value(value: Value) -> Result<Self, CollectorError> {
        serde_json::from_value(value)
            .map_err(|err| CollectorError::transform(format!("invalid sample: {err}")))
    }
}

/// Accept strings, numbers, booleans and null for `value`, normalizing to a string.
fn deserialize_value<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(String::new()),
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "sample value must be a scalar, got {other}"
        ))),
    }
}
