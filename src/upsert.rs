//! # Bulk Upsert
//!
//! Delivers sample batches to `POST <refocusUrl>/v1/samples/upsert/bulk`.
//! A 429 response is retried after its `Retry-After` delay for as long as the
//! total retry budget allows; past the budget the batch is dropped and the
//! drop is reported as a normal outcome so the caller is never blocked
//! indefinitely. Any other non-2xx response is an error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use reqwest::{Client, Proxy, StatusCode, header::HeaderMap};
use serde::Deserialize;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::error::CollectorError;
use crate::models::Sample;
use crate::queue::{DeliveryTarget, SampleSink};
use crate::state::LiveState;

/// Path of the bulk upsert endpoint relative to the Refocus base URL.
pub const BULK_UPSERT_PATH: &str = "/v1/samples/upsert/bulk";

/// Delay used when a 429 response carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Build an HTTP client with the given request timeout and optional proxy.
pub fn build_http_client(timeout: Duration, proxy: Option<&str>) -> Result<Client, CollectorError> {
    let mut builder = Client::builder().timeout(timeout);
    if let Some(proxy) = proxy.filter(|proxy| !proxy.is_empty()) {
        let proxy = Proxy::all(proxy)
            .map_err(|err| CollectorError::validation(format!("invalid proxy {}: {}", proxy, err)))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|err| CollectorError::Network(format!("failed to build HTTP client: {}", err)))
}

/// Result of one bulk upsert call.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// Empty batch; nothing was sent.
    Skipped,
    /// The endpoint accepted the batch.
    Accepted {
        status: Option<String>,
        job_id: Option<String>,
        retries: u32,
    },
    /// The retry budget ran out while throttled; the batch was discarded.
    Dropped { message: String, retries: u32 },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    job_id: Option<String>,
}

/// HTTP client for the bulk upsert endpoint.
pub struct BulkUpsertClient {
    timeout: Duration,
    default_client: Client,
    proxied: Mutex<HashMap<String, Client>>,
}

impl BulkUpsertClient {
    pub fn new(timeout: Duration) -> Result<Self, CollectorError> {
        Ok(Self {
            timeout,
            default_client: build_http_client(timeout, None)?,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<Client, CollectorError> {
        let Some(proxy) = proxy.filter(|proxy| !proxy.is_empty()) else {
            return Ok(self.default_client.clone());
        };
        let mut cache = self.proxied.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = cache.get(proxy) {
            return Ok(client.clone());
        }
        let client = build_http_client(self.timeout, Some(proxy))?;
        cache.insert(proxy.to_string(), client.clone());
        Ok(client)
    }

    /// Post `samples` in a single request, retrying on 429 within `target.max_retry`.
    pub async fn post_bulk(
        &self,
        target: &DeliveryTarget,
        samples: &[Sample],
    ) -> Result<UpsertOutcome, CollectorError> {
        if target.refocus_url.trim().is_empty() {
            return Err(CollectorError::validation("Bulk upsert url is missing"));
        }
        if target.token.trim().is_empty() {
            return Err(CollectorError::validation("Bulk upsert token is missing"));
        }
        if samples.is_empty() {
            return Ok(UpsertOutcome::Skipped);
        }

        let client = self.client_for(target.proxy.as_deref())?;
        let url = format!(
            "{}{}",
            target.refocus_url.trim_end_matches('/'),
            BULK_UPSERT_PATH
        );
        let started = Instant::now();
        let mut retries: u32 = 0;

        loop {
            counter!("collector_bulk_upsert_requests_total").increment(1);
            let response = client
                .post(&url)
                .header(reqwest::header::AUTHORIZATION, &target.token)
                .json(samples)
                .send()
                .await?;
            let status = response.status();

            if status.is_success() {
                let body: Option<UpsertResponse> = response.json().await.ok();
                histogram!("collector_bulk_upsert_duration_ms")
                    .record(started.elapsed().as_secs_f64() * 1_000.0);
                debug!(
                    samples = samples.len(),
                    retries,
                    job_id = ?body.as_ref().and_then(|b| b.job_id.as_deref()),
                    "Bulk upsert accepted"
                );
                return Ok(UpsertOutcome::Accepted {
                    status: body.as_ref().and_then(|b| b.status.clone()),
                    job_id: body.and_then(|b| b.job_id),
                    retries,
                });
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = retry_after(response.headers()).unwrap_or(DEFAULT_RETRY_AFTER);
                let elapsed = started.elapsed();
                if elapsed.saturating_add(wait) > target.max_retry {
                    let message = format!(
                        "Bulk upsert of {} samples dropped after {} ms",
                        samples.len(),
                        elapsed.as_millis()
                    );
                    counter!("collector_bulk_upsert_dropped_total").increment(1);
                    warn!(
                        samples = samples.len(),
                        retries,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "{}",
                        message
                    );
                    return Ok(UpsertOutcome::Dropped { message, retries });
                }

                counter!("collector_bulk_upsert_throttled_total").increment(1);
                info!(
                    wait_ms = wait.as_millis() as u64,
                    retries, "Bulk upsert throttled; retrying"
                );
                retries += 1;
                sleep(wait).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            counter!("collector_bulk_upsert_failures_total").increment(1);
            return Err(CollectorError::http(status.as_u16(), &body));
        }
    }
}

/// Parse `Retry-After` as (possibly fractional) seconds or an HTTP date.
/// Delays too large for a `Duration` saturate to `Duration::MAX`.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())?
        .trim();

    if let Ok(seconds) = value.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 {
            return Some(Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX));
        }
        return None;
    }

    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Queue sink that splits a flushed batch into chunks of the live
/// `maxSamplesPerBulkRequest` and posts each chunk.
pub struct UpsertSink {
    client: Arc<BulkUpsertClient>,
    state: Arc<LiveState>,
}

impl UpsertSink {
    pub fn new(client: Arc<BulkUpsertClient>, state: Arc<LiveState>) -> Self {
        Self { client, state }
    }
}

#[async_trait]
impl SampleSink for UpsertSink {
    async fn flush(&self, batch: Vec<Sample>, target: &DeliveryTarget) -> Result<(), CollectorError> {
        let chunk_size = self.state.runtime().max_samples_per_bulk_request.max(1);
        let mut first_error = None;

        for chunk in batch.chunks(chunk_size) {
            match self.client.post_bulk(target, chunk).await {
                Ok(UpsertOutcome::Dropped { message, .. }) => {
                    debug!(samples = chunk.len(), "{}", message);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(samples = chunk.len(), error = %err, "Bulk upsert chunk failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
