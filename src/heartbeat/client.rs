use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use reqwest::Client;
use tracing::debug;

use crate::error::CollectorError;
use crate::models::{CollectorInfo, HeartbeatRequest, HeartbeatResponse};
use crate::upsert::build_http_client;

/// Sends heartbeats to `POST <refocusUrl>/v1/collectors/<name>/heartbeat`.
pub struct HeartbeatClient {
    client: Client,
    refocus_url: String,
    token: String,
    collector_name: String,
}

impl HeartbeatClient {
    pub fn new(
        refocus_url: &str,
        token: &str,
        collector_name: &str,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, CollectorError> {
        Ok(Self {
            client: build_http_client(timeout, proxy)?,
            refocus_url: refocus_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            collector_name: collector_name.to_string(),
        })
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/v1/collectors/{}/heartbeat",
            self.refocus_url, self.collector_name
        )
    }

    pub async fn send(&self) -> Result<HeartbeatResponse, CollectorError> {
        let request = HeartbeatRequest {
            timestamp: Utc::now().to_rfc3339(),
            collector_config: CollectorInfo::default(),
        };

        counter!("collector_heartbeats_total").increment(1);
        let response = self
            .client
            .post(self.endpoint())
            .header(reqwest::header::AUTHORIZATION, &self.token)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            counter!("collector_heartbeat_failures_total").increment(1);
            return Err(CollectorError::http(status.as_u16(), &body));
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(HeartbeatResponse::default());
        }
        let parsed = serde_json::from_str::<HeartbeatResponse>(&body).map_err(|err| {
            CollectorError::validation(format!("Malformed heartbeat response: {}", err))
        })?;
        debug!(collector = %self.collector_name, "Heartbeat acknowledged");
        Ok(parsed)
    }
}
