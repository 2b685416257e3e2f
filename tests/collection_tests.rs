use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use collector::collect::{Collector, CollectorSettings};
use collector::error::CollectorError;
use collector::models::{Generator, Sample};
use collector::queue::{DeliveryTarget, QueueConfig, QueueRegistry, SampleSink};
use serde_json::{Value, json};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path},
};

#[derive(Default)]
struct CapturingSink {
    batches: Mutex<Vec<Vec<Sample>>>,
}

impl CapturingSink {
    fn samples(&self) -> Vec<Sample> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl SampleSink for CapturingSink {
    async fn flush(&self, batch: Vec<Sample>, _target: &DeliveryTarget) -> Result<(), CollectorError> {
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}

struct Harness {
    server: MockServer,
    sink: Arc<CapturingSink>,
    queues: Arc<QueueRegistry>,
    collector: Collector,
}

impl Harness {
    async fn start() -> Self {
        let server = MockServer::start().await;
        let sink = Arc::new(CapturingSink::default());
        let queues = Arc::new(QueueRegistry::new(sink.clone()));
        let collector = Collector::new(
            CollectorSettings {
                refocus_url: server.uri(),
                refocus_token: "collector-token".to_string(),
                refocus_proxy: None,
                data_source_proxy: None,
                sandbox_timeout: Duration::from_secs(2),
                remote_request_timeout: Duration::from_secs(5),
            },
            queues.clone(),
        )
        .unwrap();
        Self {
            server,
            sink,
            queues,
            collector,
        }
    }

    fn open_queue(&self, name: &str) {
        self.queues
            .create(QueueConfig {
                name: name.to_string(),
                size: 100,
                flush_timeout: Duration::from_secs(60),
                target: DeliveryTarget {
                    refocus_url: self.server.uri(),
                    token: "collector-token".to_string(),
                    proxy: None,
                    max_retry: Duration::from_secs(5),
                },
            })
            .unwrap();
    }

    async fn flushed(&self, name: &str) -> Vec<Sample> {
        self.queues.flush(name).await.unwrap();
        self.sink.samples()
    }
}

fn per_subject_generator(base: &str, transform: Value) -> Generator {
    Generator::from_value(&json!({
        "name": "latency",
        "context": {"base": base, "apiKey": "k-123"},
        "aspects": [{"name": "Latency"}],
        "subject": {"absolutePath": "Root.A"},
        "generatorTemplate": {
            "connection": {
                "url": "{{base}}/status/{{subject.absolutePath}}",
                "headers": {"Authorization": "Bearer {{apiKey}}"}
            },
            "transform": transform
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn test_collects_and_enqueues_transformed_samples() {
    let harness = Harness::start().await;
    Mock::given(method("GET"))
        .and(path("/status/Root.A"))
        .and(header("authorization", "Bearer k-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"latency": 12})))
        .mount(&harness.server)
        .await;

    let generator = per_subject_generator(
        &harness.server.uri(),
        json!({
            "default": "return [#{name: subject.absolutePath + \"|Latency\", value: res.body.latency}];"
        }),
    );
    assert_eq!(generator.instance_name(), "latency::Root.A");
    harness.open_queue("latency::Root.A");

    let report = harness.collector.collect(&generator).await.unwrap();
    assert_eq!(report.samples, 1);
    assert!(report.error.is_none());

    let samples = harness.flushed("latency::Root.A").await;
    assert_eq!(samples, vec![Sample::new("Root.A|Latency", "12")]);
}

#[tokio::test]
async fn test_error_handler_matches_status_pattern() {
    let harness = Harness::start().await;
    Mock::given(method("GET"))
        .and(path("/status/Root.A"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such host"))
        .mount(&harness.server)
        .await;

    let generator = per_subject_generator(
        &harness.server.uri(),
        json!({
            "default": "return [];",
            "errorHandlers": {
                "40[0-9]": "return [#{name: subject.absolutePath + \"|Latency\", value: \"0\", messageBody: res.text}];"
            }
        }),
    );
    harness.open_queue("latency::Root.A");

    let report = harness.collector.collect(&generator).await.unwrap();
    assert!(report.error.is_none());

    let samples = harness.flushed("latency::Root.A").await;
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].value, "0");
    assert_eq!(samples[0].message_body.as_deref(), Some("no such host"));
}

#[tokio::test]
async fn test_unhandled_status_becomes_error_samples() {
    let harness = Harness::start().await;
    Mock::given(method("GET"))
        .and(path("/status/Root.A"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&harness.server)
        .await;

    let generator = per_subject_generator(
        &harness.server.uri(),
        json!({"default": "return [];"}),
    );
    harness.open_queue("latency::Root.A");

    let report = harness.collector.collect(&generator).await.unwrap();
    assert_eq!(report.error.as_ref().map(CollectorError::name), Some("HttpError"));
    assert!(!report.error.as_ref().unwrap().is_template_error());

    let samples = harness.flushed("latency::Root.A").await;
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].name, "Root.A|Latency");
    assert_eq!(samples[0].value, "ERROR");
    assert_eq!(samples[0].message_code.as_deref(), Some("ERROR"));
}

#[tokio::test]
async fn test_invalid_samples_are_replaced_by_error_samples() {
    let harness = Harness::start().await;
    Mock::given(method("GET"))
        .and(path("/status/Root.A"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&harness.server)
        .await;

    let generator = per_subject_generator(
        &harness.server.uri(),
        json!({"default": "return [#{name: \"Root.Other|Latency\", value: \"1\"}];"}),
    );
    harness.open_queue("latency::Root.A");

    let report = harness.collector.collect(&generator).await.unwrap();
    let error = report.error.unwrap();
    assert_eq!(error.name(), "ValidationError");
    assert!(error.to_string().contains("Unknown subject or aspect"));

    let samples = harness.flushed("latency::Root.A").await;
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].name, "Root.A|Latency");
    assert_eq!(samples[0].value, "ERROR");
}

#[tokio::test]
async fn test_failing_transform_is_a_template_error() {
    let harness = Harness::start().await;
    Mock::given(method("GET"))
        .and(path("/status/Root.A"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&harness.server)
        .await;

    let generator = per_subject_generator(
        &harness.server.uri(),
        json!({"default": "throw \"no data\";"}),
    );
    harness.open_queue("latency::Root.A");

    let report = harness.collector.collect(&generator).await.unwrap();
    let error = report.error.unwrap();
    assert!(error.is_template_error());

    let samples = harness.flushed("latency::Root.A").await;
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].value, "ERROR");
}

#[tokio::test]
async fn test_bulk_generator_resolves_subject_query() {
    let harness = Harness::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/subjects"))
        .and(header("authorization", "collector-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"absolutePath": "Root.A"},
            {"absolutePath": "Root.B"}
        ])))
        .mount(&harness.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"up": 1})))
        .mount(&harness.server)
        .await;

    let transform = r#"
        let out = [];
        for s in subjects {
            for a in aspects {
                out.push(#{name: s.absolutePath + "|" + a.name, value: res.body.up});
            }
        }
        return out;
    "#;
    let generator = Generator::from_value(&json!({
        "name": "bulk-up",
        "subjectQuery": "absolutePath=Root.*",
        "context": {"base": harness.server.uri()},
        "aspects": [{"name": "Up"}, {"name": "Latency"}],
        "generatorTemplate": {
            "connection": {"url": "{{base}}/bulk", "bulk": true},
            "transform": {"default": transform}
        }
    }))
    .unwrap();
    assert_eq!(generator.instance_name(), "bulk-up");
    harness.open_queue("bulk-up");

    let report = harness.collector.collect(&generator).await.unwrap();
    assert!(report.error.is_none());
    assert_eq!(report.samples, 4);

    let names: Vec<String> = harness
        .flushed("bulk-up")
        .await
        .into_iter()
        .map(|sample| sample.name)
        .collect();
    assert_eq!(
        names,
        vec!["Root.A|Up", "Root.A|Latency", "Root.B|Up", "Root.B|Latency"]
    );
}

#[tokio::test]
async fn test_to_url_function_builds_request_url() {
    let harness = Harness::start().await;
    Mock::given(method("GET"))
        .and(path("/custom/Root.A"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"latency": 3})))
        .mount(&harness.server)
        .await;

    let generator = Generator::from_value(&json!({
        "name": "custom",
        "context": {"base": harness.server.uri()},
        "aspects": [{"name": "Latency"}],
        "subject": {"absolutePath": "Root.A"},
        "generatorTemplate": {
            "connection": {"toUrl": "return ctx.base + \"/custom/\" + subject.absolutePath;"},
            "transform": {
                "default": "return [#{name: subject.absolutePath + \"|Latency\", value: res.body.latency}];"
            }
        }
    }))
    .unwrap();
    harness.open_queue("custom::Root.A");

    let report = harness.collector.collect(&generator).await.unwrap();
    assert!(report.error.is_none());
    assert_eq!(
        harness.flushed("custom::Root.A").await,
        vec![Sample::new("Root.A|Latency", "3")]
    );
}

#[tokio::test]
async fn test_generator_without_aspects_collects_nothing() {
    let harness = Harness::start().await;
    let generator = Generator::from_value(&json!({
        "name": "empty",
        "subject": {"absolutePath": "Root.A"}
    }))
    .unwrap();

    let report = harness.collector.collect(&generator).await.unwrap();
    assert_eq!(report.samples, 0);
    assert!(harness.server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_discover_subjects_propagates_http_errors() {
    let harness = Harness::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/subjects"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
        .mount(&harness.server)
        .await;

    let err = harness
        .collector
        .discover_subjects("absolutePath=Root.*")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CollectorError::Http {
            status: 401,
            body: "bad token".to_string()
        }
    );
}
