//! # Buffered Sample Queues
//!
//! One in-memory queue per generator instance. A queue accumulates samples and
//! hands them to a [`SampleSink`] when it reaches capacity or when no capacity
//! flush happened within `flush_timeout` of the last enqueue.
//!
//! Buffer mutations happen under the queue lock and a flushed batch is taken
//! out of the buffer atomically, so a capacity flush and a timeout flush never
//! deliver the same samples. Delivery runs outside the lock. A failed delivery
//! is logged and the batch is dropped; retrying is the sink's job.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CollectorError;
use crate::models::Sample;

/// Where a queue's batches are delivered. Opaque to the queue itself.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryTarget {
    pub refocus_url: String,
    pub token: String,
    pub proxy: Option<String>,
    /// Total time the sink may spend retrying a throttled batch.
    pub max_retry: Duration,
}

/// Destination for flushed batches.
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn flush(&self, batch: Vec<Sample>, target: &DeliveryTarget) -> Result<(), CollectorError>;
}

/// Creation parameters for a queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub size: usize,
    pub flush_timeout: Duration,
    pub target: DeliveryTarget,
}

struct QueueState {
    buffer: Vec<Sample>,
    size: usize,
    flush_timeout: Duration,
    timer: Option<CancellationToken>,
    last_activity: Instant,
}

/// A single named sample buffer.
pub struct BufferedQueue {
    name: String,
    state: Mutex<QueueState>,
    sink: Arc<dyn SampleSink>,
    target: DeliveryTarget,
    this: Weak<BufferedQueue>,
}

impl BufferedQueue {
    pub fn new(config: QueueConfig, sink: Arc<dyn SampleSink>) -> Result<Arc<Self>, CollectorError> {
        if config.name.is_empty() {
            return Err(CollectorError::args("queue name must not be empty"));
        }
        validate_size(config.size)?;
        validate_timeout(config.flush_timeout)?;

        Ok(Arc::new_cyclic(|this| BufferedQueue {
            name: config.name,
            state: Mutex::new(QueueState {
                buffer: Vec::new(),
                size: config.size,
                flush_timeout: config.flush_timeout,
                timer: None,
                last_activity: Instant::now(),
            }),
            sink,
            target: config.target,
            this: this.clone(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &DeliveryTarget {
        &self.target
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.buffer.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.size
    }

    pub async fn flush_timeout(&self) -> Duration {
        self.state.lock().await.flush_timeout
    }

    /// Append `items` one at a time. Every append that brings the buffer to
    /// capacity takes the whole buffer as a batch; those batches are delivered
    /// before this returns. Any remainder waits for the flush timer.
    ///
    /// A full buffer is never held back to be merged with the next call, so
    /// `size + 1` items deliver a batch of `size` at once and leave one sample
    /// for the timer, an explicit flush, or disposal.
    pub async fn enqueue(&self, items: Vec<Sample>) {
        if items.is_empty() {
            return;
        }
        let count = items.len();

        let batches = {
            let mut state = self.state.lock().await;
            let mut batches = Vec::new();
            for item in items {
                state.buffer.push(item);
                if state.buffer.len() >= state.size {
                    batches.push(std::mem::take(&mut state.buffer));
                }
            }
            state.last_activity = Instant::now();
            self.rearm_timer(&mut state);
            batches
        };

        counter!("collector_samples_enqueued_total", &self.labels()).increment(count as u64);
        for batch in batches {
            self.deliver(batch, "capacity").await;
        }
    }

    /// Flush whatever is buffered. Flushing an empty queue does nothing.
    pub async fn flush(&self) {
        let batch = {
            let mut state = self.state.lock().await;
            cancel_timer(&mut state);
            std::mem::take(&mut state.buffer)
        };
        if !batch.is_empty() {
            self.deliver(batch, "manual").await;
        }
    }

    /// Change the capacity. A buffer already at the new capacity is flushed.
    pub async fn update_size(&self, size: usize) -> Result<(), CollectorError> {
        validate_size(size)?;
        let batch = {
            let mut state = self.state.lock().await;
            state.size = size;
            if state.buffer.len() >= size {
                cancel_timer(&mut state);
                Some(std::mem::take(&mut state.buffer))
            } else {
                None
            }
        };
        if let Some(batch) = batch {
            self.deliver(batch, "capacity").await;
        }
        Ok(())
    }

    /// Change the flush timeout; a pending timer is re-armed with the new value.
    pub async fn update_flush_timeout(&self, flush_timeout: Duration) -> Result<(), CollectorError> {
        validate_timeout(flush_timeout)?;
        let mut state = self.state.lock().await;
        state.flush_timeout = flush_timeout;
        if state.timer.is_some() {
            self.rearm_timer(&mut state);
        }
        Ok(())
    }

    fn rearm_timer(&self, state: &mut QueueState) {
        cancel_timer(state);
        if state.buffer.is_empty() {
            return;
        }

        let token = CancellationToken::new();
        state.timer = Some(token.clone());
        let queue = self.this.clone();
        let timeout = state.flush_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(timeout) => {
                    if let Some(queue) = queue.upgrade() {
                        queue.flush_on_timeout(&token).await;
                    }
                }
            }
        });
    }

    async fn flush_on_timeout(&self, token: &CancellationToken) {
        let batch = {
            let mut state = self.state.lock().await;
            // A capacity flush or a newer enqueue got here first.
            if token.is_cancelled() {
                return;
            }
            state.timer = None;
            std::mem::take(&mut state.buffer)
        };
        if !batch.is_empty() {
            self.deliver(batch, "timeout").await;
        }
    }

    async fn deliver(&self, batch: Vec<Sample>, trigger: &'static str) {
        let count = batch.len();
        let started = Instant::now();
        let mut labels = self.labels();
        labels.push(("trigger", trigger.to_string()));

        match self.sink.flush(batch, &self.target).await {
            Ok(()) => {
                debug!(queue = %self.name, samples = count, trigger, "Flushed sample queue");
                counter!("collector_queue_flushes_total", &labels).increment(1);
            }
            Err(err) => {
                error!(
                    queue = %self.name,
                    samples = count,
                    trigger,
                    error = %err,
                    "Sample queue flush failed; batch dropped"
                );
                counter!("collector_queue_flush_failures_total", &labels).increment(1);
            }
        }
        histogram!("collector_queue_flush_duration_ms", &labels)
            .record(started.elapsed().as_secs_f64() * 1_000.0);
    }

    fn labels(&self) -> Vec<(&'static str, String)> {
        vec![("queue", self.name.clone())]
    }
}

impl Drop for BufferedQueue {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_lock() {
            cancel_timer(&mut state);
        }
    }
}

fn cancel_timer(state: &mut QueueState) {
    if let Some(timer) = state.timer.take() {
        timer.cancel();
    }
}

fn validate_size(size: usize) -> Result<(), CollectorError> {
    if size == 0 {
        return Err(CollectorError::validation(
            "queue size must be a positive number",
        ));
    }
    Ok(())
}

fn validate_timeout(timeout: Duration) -> Result<(), CollectorError> {
    if timeout.is_zero() {
        return Err(CollectorError::validation(
            "queue flush timeout must be a positive number",
        ));
    }
    Ok(())
}

/// Named queue registry shared by the reconciler and collection tasks.
pub struct QueueRegistry {
    queues: RwLock<HashMap<String, Arc<BufferedQueue>>>,
    sink: Arc<dyn SampleSink>,
}

impl QueueRegistry {
    pub fn new(sink: Arc<dyn SampleSink>) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            sink,
        }
    }

    /// Create the queue named in `config`, or return the live one of that name.
    pub fn create(&self, config: QueueConfig) -> Result<Arc<BufferedQueue>, CollectorError> {
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = queues.get(&config.name) {
            return Ok(existing.clone());
        }

        let name = config.name.clone();
        let queue = BufferedQueue::new(config, self.sink.clone())?;
        queues.insert(name.clone(), queue.clone());
        info!(queue = %name, "Created sample queue");
        Ok(queue)
    }

    pub fn get(&self, name: &str) -> Option<Arc<BufferedQueue>> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn all(&self) -> Vec<Arc<BufferedQueue>> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn require(&self, name: &str) -> Result<Arc<BufferedQueue>, CollectorError> {
        self.get(name)
            .ok_or_else(|| CollectorError::validation(format!("Queue not found: {}", name)))
    }

    /// Enqueue into the named queue. A missing queue is an error the caller
    /// may treat as a best-effort drop.
    pub async fn enqueue(&self, name: &str, items: Vec<Sample>) -> Result<(), CollectorError> {
        self.require(name)?.enqueue(items).await;
        Ok(())
    }

    pub async fn flush(&self, name: &str) -> Result<(), CollectorError> {
        self.require(name)?.flush().await;
        Ok(())
    }

    pub async fn flush_all(&self) {
        for queue in self.all() {
            queue.flush().await;
        }
    }

    pub async fn update_size(&self, name: &str, size: usize) -> Result<(), CollectorError> {
        self.require(name)?.update_size(size).await
    }

    pub async fn update_flush_timeout(
        &self,
        name: &str,
        flush_timeout: Duration,
    ) -> Result<(), CollectorError> {
        self.require(name)?.update_flush_timeout(flush_timeout).await
    }

    /// Apply new thresholds to every live queue.
    pub async fn update_all(&self, size: usize, flush_timeout: Duration) {
        for queue in self.all() {
            if let Err(err) = queue.update_size(size).await {
                warn!(queue = %queue.name(), error = %err, "Failed to update queue size");
            }
            if let Err(err) = queue.update_flush_timeout(flush_timeout).await {
                warn!(queue = %queue.name(), error = %err, "Failed to update queue flush timeout");
            }
        }
    }

    /// Remove the named queue after flushing what it holds. Unknown names are ignored.
    pub async fn dispose(&self, name: &str) -> bool {
        let removed = self
            .queues
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        match removed {
            Some(queue) => {
                queue.flush().await;
                info!(queue = %name, "Disposed sample queue");
                true
            }
            None => false,
        }
    }

    pub async fn dispose_all(&self) {
        for name in self.names() {
            self.dispose(&name).await;
        }
    }
}
