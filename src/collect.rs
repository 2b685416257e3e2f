//! # Collection Pipeline
//!
//! One run of a generator instance: resolve subjects, build the request URL,
//! fetch the remote data source, transform the response in the sandbox,
//! validate the samples, and enqueue them on the instance's queue.
//!
//! Template failures (URL building, transform, validation) and data-source
//! failures do not fail the run. They are turned into one error sample per
//! expected `subject|aspect` so the failure shows up downstream, and the
//! generator keeps its schedule.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use regex::Regex;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Map, Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::expand_template;
use crate::error::CollectorError;
use crate::models::{Generator, Sample, Subject, Transform};
use crate::queue::QueueRegistry;
use crate::sandbox::Sandbox;
use crate::telemetry::current_trace_id;
use crate::upsert::build_http_client;
use crate::validation::validate_samples;

/// Path of the subject discovery endpoint relative to the Refocus base URL.
pub const SUBJECTS_PATH: &str = "/v1/subjects";

/// Summary of one collection run.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionReport {
    pub instance: String,
    /// Samples handed to the queue, error samples included.
    pub samples: usize,
    /// Failure that was converted into error samples, if any.
    pub error: Option<CollectorError>,
}

/// Settings the collector needs from the process configuration.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub refocus_url: String,
    pub refocus_token: String,
    pub refocus_proxy: Option<String>,
    pub data_source_proxy: Option<String>,
    pub sandbox_timeout: Duration,
    pub remote_request_timeout: Duration,
}

/// Runs the per-tick collection pipeline for generator instances.
pub struct Collector {
    sandbox: Sandbox,
    data_client: Client,
    refocus_client: Client,
    refocus_url: String,
    refocus_token: String,
    queues: Arc<QueueRegistry>,
}

impl Collector {
    pub fn new(settings: CollectorSettings, queues: Arc<QueueRegistry>) -> Result<Self, CollectorError> {
        Ok(Self {
            sandbox: Sandbox::new(settings.sandbox_timeout),
            data_client: build_http_client(
                settings.remote_request_timeout,
                settings.data_source_proxy.as_deref(),
            )?,
            refocus_client: build_http_client(
                settings.remote_request_timeout,
                settings.refocus_proxy.as_deref(),
            )?,
            refocus_url: settings.refocus_url.trim_end_matches('/').to_string(),
            refocus_token: settings.refocus_token,
            queues,
        })
    }

    pub fn queues(&self) -> &Arc<QueueRegistry> {
        &self.queues
    }

    /// Resolve subjects matching `query` through the Refocus subjects endpoint.
    pub async fn discover_subjects(&self, query: &str) -> Result<Vec<Subject>, CollectorError> {
        let query = query.trim().trim_start_matches('?');
        let url = if query.is_empty() {
            format!("{}{}", self.refocus_url, SUBJECTS_PATH)
        } else {
            format!("{}{}?{}", self.refocus_url, SUBJECTS_PATH, query)
        };

        let response = self
            .refocus_client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, &self.refocus_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollectorError::http(status.as_u16(), &body));
        }

        let subjects: Vec<Subject> = response
            .json()
            .await
            .map_err(|err| CollectorError::Network(format!("invalid subjects response: {}", err)))?;
        debug!(query = %query, count = subjects.len(), "Resolved subjects");
        Ok(subjects)
    }

    /// Run one collection for a generator instance and enqueue the result.
    pub async fn collect(&self, generator: &Generator) -> Result<CollectionReport, CollectorError> {
        let started = Instant::now();
        let instance = generator.instance_name();

        let generator = match (&generator.subject_query, generator.is_bulk()) {
            (Some(query), true) => {
                let subjects = self.discover_subjects(query).await?;
                generator.with_subjects(subjects)
            }
            _ => generator.clone(),
        };

        if generator.resolved_subjects().is_empty() || generator.aspects.is_empty() {
            debug!(instance = %instance, "No subjects or aspects to collect");
            return Ok(CollectionReport {
                instance,
                samples: 0,
                error: None,
            });
        }

        let (samples, error) = match self.produce_samples(&generator).await {
            Ok(samples) => match validate_samples(&samples, &generator) {
                Ok(()) => (samples, None),
                Err(err) => (error_samples(&generator, &err), Some(err)),
            },
            Err(err) => (error_samples(&generator, &err), Some(err)),
        };

        let labels = vec![("generator", generator.name.clone())];
        if let Some(err) = &error {
            let cause = if err.is_template_error() { "template" } else { "source" };
            let error_labels = [("generator", generator.name.clone()), ("cause", cause.to_string())];
            counter!("collector_error_samples_total", &error_labels)
                .increment(samples.len() as u64);
            warn!(
                instance = %instance,
                trace_id = ?current_trace_id(),
                cause,
                error = %err,
                "Collection failed; queued error samples"
            );
        }

        let count = samples.len();
        if let Err(err) = self.queues.enqueue(&instance, samples).await {
            warn!(instance = %instance, error = %err, "Queue is gone; samples dropped");
        }

        histogram!("collector_collection_duration_ms", &labels)
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        info!(
            instance = %instance,
            samples = count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Collection finished"
        );

        Ok(CollectionReport {
            instance,
            samples: count,
            error,
        })
    }

    async fn produce_samples(&self, generator: &Generator) -> Result<Vec<Sample>, CollectorError> {
        let mut args = base_args(generator)?;
        let connection = &generator.generator_template.connection;

        let url = match (&connection.to_url, &connection.url) {
            (Some(body), _) if !body.trim().is_empty() => {
                let sandbox = self.sandbox.clone();
                let body = body.clone();
                let url_args = Value::Object(args.clone());
                tokio::task::spawn_blocking(move || sandbox.safe_to_url(&body, &url_args)).await??
            }
            (_, Some(url)) => expand_template(url, &generator.context, &args)?,
            _ => {
                return Err(CollectorError::validation(format!(
                    "generator {} has no connection url",
                    generator.name
                )));
            }
        };

        let mut headers = BTreeMap::new();
        for (name, value) in &connection.headers {
            headers.insert(name.clone(), expand_template(value, &generator.context, &args)?);
        }

        let (status, res) = self.fetch(connection.method.as_deref(), &url, &headers).await?;
        let Some(function_body) = select_handler(&generator.generator_template.transform, status)?
        else {
            let text = res.get("text").and_then(Value::as_str).unwrap_or_default();
            return Err(CollectorError::http(status.as_u16(), text));
        };

        args.insert("res".to_string(), res);
        let sandbox = self.sandbox.clone();
        let function_body = function_body.to_string();
        let transform_args = Value::Object(args);
        let items = tokio::task::spawn_blocking(move || {
            sandbox.safe_transform(&function_body, &transform_args)
        })
        .await??;

        items.into_iter().map(Sample::from_value).collect()
    }

    async fn fetch(
        &self,
        method: Option<&str>,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<(StatusCode, Value), CollectorError> {
        let method = match method {
            Some(method) => Method::from_bytes(method.to_uppercase().as_bytes())
                .map_err(|_| CollectorError::validation(format!("invalid HTTP method {}", method)))?,
            None => Method::GET,
        };

        let mut request = self.data_client.request(method, url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;
        let status = response.status();

        let mut response_headers = Map::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                response_headers.insert(name.as_str().to_string(), Value::String(value.to_string()));
            }
        }

        let text = response.text().await?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| Value::String(text.clone()));
        debug!(url = %url, status = status.as_u16(), bytes = text.len(), "Fetched remote data");

        Ok((
            status,
            json!({
                "status": status.as_u16(),
                "statusCode": status.as_u16(),
                "ok": status.is_success(),
                "headers": response_headers,
                "body": body,
                "text": text,
            }),
        ))
    }
}

/// Bindings shared by URL building and transforms.
fn base_args(generator: &Generator) -> Result<Map<String, Value>, CollectorError> {
    let to_value = |value: serde_json::Result<Value>| {
        value.map_err(|err| CollectorError::args(format!("cannot serialize arguments: {}", err)))
    };

    let mut args = Map::new();
    args.insert("ctx".to_string(), Value::Object(generator.context.clone()));
    match (&generator.subject, &generator.subjects) {
        (Some(subject), _) => {
            args.insert("subject".to_string(), to_value(serde_json::to_value(subject))?);
        }
        (None, Some(subjects)) => {
            args.insert("subjects".to_string(), to_value(serde_json::to_value(subjects))?);
        }
        (None, None) => {}
    }
    args.insert(
        "aspects".to_string(),
        to_value(serde_json::to_value(&generator.aspects))?,
    );
    Ok(args)
}

/// Pick the transform body for a response status: the default transform for
/// 2xx, otherwise the first error handler whose pattern matches the status.
fn select_handler(transform: &Transform, status: StatusCode) -> Result<Option<&str>, CollectorError> {
    if status.is_success() {
        return Ok(Some(transform.default.as_str()));
    }

    let code = status.as_u16().to_string();
    for (pattern, body) in &transform.error_handlers {
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|err| {
            CollectorError::validation(format!("invalid error handler pattern {}: {}", pattern, err))
        })?;
        if regex.is_match(&code) {
            return Ok(Some(body.as_str()));
        }
    }
    Ok(None)
}

/// One error sample per expected `subject|aspect`.
pub fn error_samples(generator: &Generator, error: &CollectorError) -> Vec<Sample> {
    let message = error.to_string();
    let message = message.as_str();
    generator
        .resolved_subjects()
        .into_iter()
        .flat_map(|subject| {
            generator
                .aspects
                .iter()
                .map(move |aspect| Sample::error(&subject.absolute_path, &aspect.name, message))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Aspect;

    fn transform() -> Transform {
        let mut transform = Transform {
            default: "default".to_string(),
            ..Transform::default()
        };
        transform
            .error_handlers
            .insert("40[0-9]".to_string(), "client".to_string());
        transform
            .error_handlers
            .insert("5..".to_string(), "server".to_string());
        transform
    }

    #[test]
    fn test_select_handler_by_status() {
        let transform = transform();
        assert_eq!(select_handler(&transform, StatusCode::OK).unwrap(), Some("default"));
        assert_eq!(
            select_handler(&transform, StatusCode::NOT_FOUND).unwrap(),
            Some("client")
        );
        assert_eq!(
            select_handler(&transform, StatusCode::BAD_GATEWAY).unwrap(),
            Some("server")
        );
        assert_eq!(
            select_handler(&transform, StatusCode::UNAUTHORIZED).unwrap(),
            Some("client")
        );
        assert_eq!(select_handler(&transform, StatusCode::GONE).unwrap(), None);
    }

    #[test]
    fn test_select_handler_rejects_bad_pattern() {
        let mut transform = Transform::default();
        transform
            .error_handlers
            .insert("(".to_string(), "x".to_string());
        assert!(select_handler(&transform, StatusCode::NOT_FOUND).is_err());
    }

    #[test]
    fn test_error_samples_cover_cross_product() {
        let mut generator = Generator::from_value(&json!({"name": "g"})).unwrap();
        generator.subjects = Some(vec![Subject::new("Root.A"), Subject::new("Root.B")]);
        generator.aspects = vec![Aspect::new("Up"), Aspect::new("Latency")];

        let samples = error_samples(&generator, &CollectorError::transform("bad output"));
        let names: Vec<&str> = samples.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Root.A|Up", "Root.A|Latency", "Root.B|Up", "Root.B|Latency"]
        );
        assert!(samples.iter().all(|s| s.value == "ERROR"));
        assert_eq!(
            samples[0].message_body.as_deref(),
            Some("TransformError: bad output")
        );
    }

    #[test]
    fn test_base_args_binds_single_subject() {
        let mut generator = Generator::from_value(&json!({"name": "g", "context": {"k": 1}})).unwrap();
        generator.subject = Some(Subject::new("Root.A"));
        generator.aspects = vec![Aspect::new("Up")];

        let args = base_args(&generator).unwrap();
        assert_eq!(args["ctx"], json!({"k": 1}));
        assert_eq!(args["subject"], json!({"absolutePath": "Root.A"}));
        assert!(!args.contains_key("subjects"));
        assert_eq!(args["aspects"], json!([{"name": "Up"}]));
    }
}
