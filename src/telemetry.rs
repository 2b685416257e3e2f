//! Process-wide log output and the trace id carried by each collection run
//! or heartbeat.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use thiserror::Error;
use tokio::task_local;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Registry, fmt,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};
use uuid::Uuid;

use crate::config::AppConfig;

/// Id shared by every log line of one generator run or heartbeat.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
}

impl TraceContext {
    /// `<prefix>-<8 hex chars>`, e.g. `run-1f2e3d4c`.
    pub fn generate(prefix: &str) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            trace_id: format!("{}-{}", prefix, &id[..8]),
        }
    }
}

task_local! {
    static RUN_TRACE: TraceContext;
}

#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to route `log` records into tracing: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install the collector subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static SUBSCRIBER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the collector's subscriber. `RUST_LOG` wins over `LOG_LEVEL`;
/// `LOG_FORMAT=pretty` switches from JSON lines to human-readable output.
/// Later calls are no-ops.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if SUBSCRIBER_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    bridge_log_records();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let output = output_layer(&config.log_format);

    if let Err(err) = tracing_subscriber::registry().with(output).with(filter).try_init() {
        SUBSCRIBER_INSTALLED.store(false, Ordering::SeqCst);
        eprintln!("collector: keeping the existing tracing subscriber ({err})");
    }
    Ok(())
}

/// Dependencies such as rhai and reqwest log through the `log` facade.
fn bridge_log_records() {
    let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    else {
        return;
    };
    // Already bridged when an earlier LogTracer is in place.
    if !type_name_of_val(log::logger()).contains("LogTracer") {
        eprintln!("collector: `log` records will not reach the subscriber ({err})");
    }
}

fn output_layer(format: &str) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().boxed(),
    }
}

/// Run `future` with `context` as the current trace.
pub async fn with_trace_context<Fut, R>(context: TraceContext, future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    RUN_TRACE.scope(context, future).await
}

/// Trace id of the enclosing run or heartbeat, if any.
pub fn current_trace_id() -> Option<String> {
    RUN_TRACE.try_with(|ctx| ctx.trace_id.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trace_context_is_scoped_to_future() {
        assert!(current_trace_id().is_none());

        let context = TraceContext::generate("run");
        let expected = context.trace_id.clone();
        let observed = with_trace_context(context, async { current_trace_id() }).await;

        assert_eq!(observed, Some(expected));
        assert!(current_trace_id().is_none());
    }

    #[test]
    fn test_generated_ids_are_prefixed_and_short() {
        let context = TraceContext::generate("run");
        assert!(context.trace_id.starts_with("run-"));
        assert_eq!(context.trace_id.len(), "run-".len() + 8);
    }
}
