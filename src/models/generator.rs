//! Generator model
//!
//! A generator is one polling job definition delivered by the control plane:
//! what to fetch (`generatorTemplate.connection`), how to turn the response
//! into samples (`generatorTemplate.transform`), and for which subjects and
//! aspects.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CollectorError;

/// Poll period used when a generator does not declare one.
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// A monitored entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub absolute_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_published: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Subject {
    pub fn new<S: Into<String>>(absolute_path: S) -> Self {
        Self {
            absolute_path: absolute_path.into(),
            name: None,
            is_published: None,
            tags: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// A named measurement dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aspect {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Aspect {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            extra: Map::new(),
        }
    }
}

/// Remote data-source connection details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Target URL, optionally containing `{{key}}` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Function body returning the target URL, evaluated in the sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Operate over all subjects at once instead of one task per subject.
    #[serde(default)]
    pub bulk: bool,
    /// Authentication mode; token refresh is handled outside the collector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Transform code carried by a generator template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Transform {
    /// Function body run against successful responses.
    #[serde(default)]
    pub default: String,
    /// Status-code patterns (regular expressions) mapped to function bodies.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub error_handlers: BTreeMap<String, String>,
}

/// Declaration of a context variable in the template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContextDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub connection: Connection,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context_definition: BTreeMap<String, ContextDefinition>,
}

/// A named periodic data-collection job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generator {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_query: Option<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub generator_template: GeneratorTemplate,
    #[serde(default)]
    pub aspects: Vec<Aspect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subjects: Option<Vec<Subject>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
    /// Per-instance collector token, also the basis of the context secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Generator {
    /// Parse a generator definition from a heartbeat entry.
    pub fn from_value(value: &Value) -> Result<Self, CollectorError> {
        let generator: Generator = serde_json::from_value(value.clone())
            .map_err(|err| CollectorError::validation(format!("invalid generator: {err}")))?;
        if generator.name.trim().is_empty() {
            return Err(CollectorError::validation("generator name is missing"));
        }
        if generator.interval_secs == Some(0) {
            return Err(CollectorError::validation(format!(
                "generator {} has a non-positive interval",
                generator.name
            )));
        }
        Ok(generator)
    }

    pub fn is_bulk(&self) -> bool {
        self.generator_template.connection.bulk
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS))
    }

    /// Resolved subjects, whichever of `subject`/`subjects` is populated.
    pub fn resolved_subjects(&self) -> Vec<&Subject> {
        match (&self.subject, &self.subjects) {
            (Some(subject), _) => vec![subject],
            (None, Some(subjects)) => subjects.iter().collect(),
            (None, None) => Vec::new(),
        }
    }

    /// Shallow-merge the top-level fields of `update` onto this generator.
    pub fn merge(&self, update: &Value) -> Result<Self, CollectorError> {
        let Value::Object(patch) = update else {
            return Err(CollectorError::validation("generator update must be an object"));
        };

        let mut current = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (key, value) in patch {
            current.insert(key.clone(), value.clone());
        }

        Generator::from_value(&Value::Object(current))
    }

    /// Clone this generator once per subject, each clone bound to a single subject.
    pub fn fan_out(&self, subjects: &[Subject]) -> Vec<Generator> {
        subjects
            .iter()
            .map(|subject| Generator {
                subject: Some(subject.clone()),
                subjects: None,
                ..self.clone()
            })
            .collect()
    }

    /// Bind a bulk generator to a resolved subject list.
    pub fn with_subjects(&self, subjects: Vec<Subject>) -> Generator {
        Generator {
            subject: None,
            subjects: Some(subjects),
            ..self.clone()
        }
    }

    /// Name of the repeater entry and sample queue backing this generator
    /// instance. Fan-out clones are suffixed with their subject path.
    pub fn instance_name(&self) -> String {
        match (&self.subject, self.is_bulk()) {
            (Some(subject), false) => format!("{}::{}", self.name, subject.absolute_path),
            _ => self.name.clone(),
        }
    }
}
