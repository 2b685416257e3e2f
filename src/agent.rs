//! # Collector Agent
//!
//! Wires the collector together from an [`AppConfig`] and runs the heartbeat
//! loop until the control plane stops the collector or a shutdown is requested.

use std::sync::Arc;

use metrics::histogram;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::collect::{CollectionReport, Collector, CollectorSettings};
use crate::config::AppConfig;
use crate::error::CollectorError;
use crate::heartbeat::{HeartbeatClient, HeartbeatReconciler};
use crate::queue::{DeliveryTarget, QueueRegistry};
use crate::repeater::Repeater;
use crate::state::LiveState;
use crate::telemetry::{TraceContext, with_trace_context};
use crate::upsert::{BulkUpsertClient, UpsertSink};

/// A fully wired collector.
pub struct Agent {
    state: Arc<LiveState>,
    repeater: Arc<Repeater<CollectionReport>>,
    queues: Arc<QueueRegistry>,
    reconciler: HeartbeatReconciler,
    heartbeat: HeartbeatClient,
}

impl Agent {
    pub fn new(config: &AppConfig) -> Result<Self, CollectorError> {
        config.validate()?;

        let state = Arc::new(LiveState::new(
            config.collector_name.clone(),
            config.runtime.clone(),
        ));
        let upsert = Arc::new(BulkUpsertClient::new(config.remote_request_timeout())?);
        let sink = Arc::new(UpsertSink::new(upsert, state.clone()));
        let queues = Arc::new(QueueRegistry::new(sink));
        let collector = Arc::new(Collector::new(
            CollectorSettings {
                refocus_url: config.refocus_url.clone(),
                refocus_token: config.refocus_token.clone(),
                refocus_proxy: config.refocus_proxy.clone(),
                data_source_proxy: config.data_source_proxy.clone(),
                sandbox_timeout: config.sandbox_timeout(),
                remote_request_timeout: config.remote_request_timeout(),
            },
            queues.clone(),
        )?);
        let repeater = Arc::new(Repeater::new());

        let delivery = DeliveryTarget {
            refocus_url: config.refocus_url.clone(),
            token: config.refocus_token.clone(),
            proxy: config.refocus_proxy.clone(),
            max_retry: config.bulk_upsert_max_retry(),
        };
        let reconciler = HeartbeatReconciler::new(
            state.clone(),
            repeater.clone(),
            queues.clone(),
            collector,
            delivery,
        );
        let heartbeat = HeartbeatClient::new(
            &config.refocus_url,
            &config.refocus_token,
            &config.collector_name,
            config.refocus_proxy.as_deref(),
            config.remote_request_timeout(),
        )?;

        Ok(Self {
            state,
            repeater,
            queues,
            reconciler,
            heartbeat,
        })
    }

    pub fn state(&self) -> &Arc<LiveState> {
        &self.state
    }

    /// Send one heartbeat and apply its response. Returns `true` when the
    /// control plane told the collector to stop.
    pub async fn beat(&self) -> Result<bool, CollectorError> {
        let started = Instant::now();
        let response = self.heartbeat.send().await?;
        let report = self.reconciler.reconcile(&response).await;
        histogram!("collector_heartbeat_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);
        Ok(report.exit)
    }

    /// Run the heartbeat loop until `shutdown` fires or the collector is stopped.
    #[instrument(skip_all, fields(collector = %self.state.collector_name()))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), CollectorError> {
        info!(endpoint = %self.heartbeat.endpoint(), "Starting collector");

        loop {
            let context = TraceContext::generate("heartbeat");
            match with_trace_context(context, self.beat()).await {
                Ok(true) => {
                    info!("Collector stopped by control plane");
                    break;
                }
                Ok(false) => {}
                Err(err) => warn!(error = %err, "Heartbeat failed"),
            }

            let interval = self.state.runtime().heartbeat_interval();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Collector shutdown requested");
                    break;
                }
                _ = sleep(interval) => {}
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop every repeat, flush and dispose every queue, and forget all generators.
    pub async fn shutdown(&self) {
        let stopped = self.repeater.stop_all();
        self.queues.dispose_all().await;
        self.state.clear_generators();
        info!(stopped, "Collector stopped");
    }
}

/// Cancel `token` on Ctrl-C.
pub fn shutdown_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => token.cancel(),
            Err(err) => error!(error = %err, "Failed to listen for Ctrl-C"),
        }
    });
}
