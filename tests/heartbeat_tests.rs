use std::time::Duration;

use collector::agent::Agent;
use collector::config::{AppConfig, CollectorRuntimeConfig};
use collector::heartbeat::HeartbeatClient;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header, method, path},
};

const HEARTBEAT_PATH: &str = "/v1/collectors/collector-1/heartbeat";

fn config(server: &MockServer) -> AppConfig {
    AppConfig {
        collector_name: "collector-1".to_string(),
        refocus_url: server.uri(),
        refocus_token: "collector-token".to_string(),
        runtime: CollectorRuntimeConfig {
            heartbeat_interval_millis: 50,
            ..CollectorRuntimeConfig::default()
        },
        ..AppConfig::default()
    }
}

#[tokio::test]
async fn test_heartbeat_posts_collector_info() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(HEARTBEAT_PATH))
        .and(header("authorization", "collector-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "timestamp": 1700000000000u64,
            "collectorConfig": {"heartbeatIntervalMillis": 1000},
            "generatorsAdded": []
        })))
        .mount(&server)
        .await;

    let client = HeartbeatClient::new(
        &server.uri(),
        "collector-token",
        "collector-1",
        None,
        Duration::from_secs(5),
    )
    .unwrap();
    let response = client.send().await.unwrap();

    assert_eq!(response.timestamp_string().as_deref(), Some("1700000000000"));
    assert_eq!(
        response.collector_config.unwrap()["heartbeatIntervalMillis"],
        json!(1000)
    );

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(body["timestamp"].is_string());
    assert_eq!(body["collectorConfig"]["version"], json!(env!("CARGO_PKG_VERSION")));
    assert!(body["collectorConfig"]["osInfo"]["platform"].is_string());
}

#[tokio::test]
async fn test_heartbeat_rejection_is_http_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(HEARTBEAT_PATH))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;

    let client = HeartbeatClient::new(
        &server.uri(),
        "collector-token",
        "collector-1",
        None,
        Duration::from_secs(5),
    )
    .unwrap();
    let err = client.send().await.unwrap_err();
    assert_eq!(err.name(), "HttpError");
}

#[tokio::test]
async fn test_agent_beat_applies_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(HEARTBEAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "generatorsAdded": [{
                "name": "g",
                "intervalSecs": 3600,
                "subjects": [{"absolutePath": "Root.A"}],
                "generatorTemplate": {"connection": {"url": "http://127.0.0.1:1/unused"}}
            }]
        })))
        .mount(&server)
        .await;

    let agent = Agent::new(&config(&server)).unwrap();
    let exit = agent.beat().await.unwrap();

    assert!(!exit);
    assert!(agent.state().contains_generator("g"));
    agent.shutdown().await;
    assert!(!agent.state().contains_generator("g"));
}

#[tokio::test]
async fn test_agent_run_exits_when_stopped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(HEARTBEAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "collectorConfig": {"status": "Stopped"}
        })))
        .mount(&server)
        .await;

    let agent = Agent::new(&config(&server)).unwrap();
    tokio::time::timeout(Duration::from_secs(5), agent.run(CancellationToken::new()))
        .await
        .expect("agent exits on stop directive")
        .unwrap();
}

#[tokio::test]
async fn test_agent_run_keeps_beating_through_failures_until_cancelled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(HEARTBEAT_PATH))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let agent = Agent::new(&config(&server)).unwrap();
    let shutdown = CancellationToken::new();
    let canceller = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), agent.run(shutdown))
        .await
        .expect("agent exits on shutdown")
        .unwrap();
    assert!(server.received_requests().await.unwrap().len() >= 2);
}

#[test]
fn test_agent_rejects_incomplete_config() {
    let err = match Agent::new(&AppConfig::default()) {
        Ok(_) => panic!("expected configuration error"),
        Err(err) => err,
    };
    assert_eq!(err.name(), "ValidationError");
}
