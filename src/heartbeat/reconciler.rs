//! Heartbeat reconciliation.
//!
//! Brings the scheduled generator instances in line with one heartbeat
//! response: merges `collectorConfig`, applies status transitions, then walks
//! `generatorsAdded`, `generatorsUpdated` and `generatorsDeleted`. A malformed
//! section or entry is logged and skipped; the rest of the heartbeat still
//! applies.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::collect::{CollectionReport, Collector};
use crate::config::{CollectorRuntimeConfig, CollectorStatus};
use crate::context::{apply_defaults, prepare_context};
use crate::error::CollectorError;
use crate::models::{DeletedGenerator, Generator, HeartbeatResponse};
use crate::queue::{DeliveryTarget, QueueConfig, QueueRegistry};
use crate::repeater::{RepeatSpec, Repeater, task_fn};
use crate::state::{GeneratorRecord, LiveState};

/// What one reconciliation did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    /// Sections or entries that could not be applied.
    pub skipped: usize,
    /// Status transition applied, if the status changed.
    pub transition: Option<(CollectorStatus, CollectorStatus)>,
    /// The collector was told to stop; the caller should exit.
    pub exit: bool,
}

/// Drives the repeater and queue registry from heartbeat responses.
pub struct HeartbeatReconciler {
    state: Arc<LiveState>,
    repeater: Arc<Repeater<CollectionReport>>,
    queues: Arc<QueueRegistry>,
    collector: Arc<Collector>,
    delivery: DeliveryTarget,
}

impl HeartbeatReconciler {
    /// `delivery` carries the collector-wide upsert target; generators with
    /// their own token deliver with that token instead.
    pub fn new(
        state: Arc<LiveState>,
        repeater: Arc<Repeater<CollectionReport>>,
        queues: Arc<QueueRegistry>,
        collector: Arc<Collector>,
        delivery: DeliveryTarget,
    ) -> Self {
        Self {
            state,
            repeater,
            queues,
            collector,
            delivery,
        }
    }

    pub fn state(&self) -> &Arc<LiveState> {
        &self.state
    }

    pub async fn reconcile(&self, response: &HeartbeatResponse) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        if let Some(patch) = &response.collector_config {
            self.apply_collector_config(patch, &mut report).await;
            if report.exit {
                return report;
            }
        }

        let timestamp = response.timestamp_string();

        if let Some(entries) = section(&response.generators_added, "generatorsAdded", &mut report) {
            for entry in entries {
                match self.add_generator(entry, timestamp.as_deref()).await {
                    Ok(name) => report.added.push(name),
                    Err(err) => {
                        report.skipped += 1;
                        warn!(error = %err, "Skipping generatorsAdded entry");
                    }
                }
            }
        }

        if let Some(entries) = section(&response.generators_updated, "generatorsUpdated", &mut report)
        {
            for entry in entries {
                match self.update_generator(entry, timestamp.as_deref()).await {
                    Ok(name) => report.updated.push(name),
                    Err(err) => {
                        report.skipped += 1;
                        warn!(error = %err, "Skipping generatorsUpdated entry");
                    }
                }
            }
        }

        if let Some(entries) = section(&response.generators_deleted, "generatorsDeleted", &mut report)
        {
            for entry in entries {
                match serde_json::from_value::<DeletedGenerator>(entry.clone()) {
                    Ok(deleted) => {
                        self.delete_generator(&deleted.name).await;
                        report.deleted.push(deleted.name);
                    }
                    Err(err) => {
                        report.skipped += 1;
                        warn!(error = %err, "Skipping generatorsDeleted entry");
                    }
                }
            }
        }

        if !report.added.is_empty() || !report.updated.is_empty() || !report.deleted.is_empty() {
            info!(
                added = report.added.len(),
                updated = report.updated.len(),
                deleted = report.deleted.len(),
                skipped = report.skipped,
                "Reconciled heartbeat"
            );
        }
        report
    }

    async fn apply_collector_config(
        &self,
        patch: &serde_json::Map<String, Value>,
        report: &mut ReconcileReport,
    ) {
        let previous = self.state.runtime();
        let (merged, rejected) = previous.merged(patch);
        for (key, err) in rejected {
            report.skipped += 1;
            warn!(key = %key, error = %err, "Ignoring invalid collectorConfig key");
        }
        self.state.set_runtime(merged.clone());

        if merged.max_samples_per_bulk_request != previous.max_samples_per_bulk_request
            || merged.sample_upsert_queue_time_millis != previous.sample_upsert_queue_time_millis
        {
            self.queues
                .update_all(merged.max_samples_per_bulk_request, merged.queue_flush_timeout())
                .await;
            debug!(
                size = merged.max_samples_per_bulk_request,
                flush_timeout_ms = merged.sample_upsert_queue_time_millis,
                "Applied queue settings to live queues"
            );
        }

        if merged.status != previous.status {
            report.transition = Some((previous.status, merged.status));
            self.transition(previous.status, merged.status, report).await;
        }
    }

    async fn transition(
        &self,
        from: CollectorStatus,
        to: CollectorStatus,
        report: &mut ReconcileReport,
    ) {
        info!(from = ?from, to = ?to, "Collector status changed");
        match to {
            CollectorStatus::Stopped => {
                self.repeater.stop_all();
                self.queues.dispose_all().await;
                report.exit = true;
            }
            CollectorStatus::Paused => {
                self.repeater.stop_all();
                self.queues.flush_all().await;
            }
            CollectorStatus::Running => {
                for record in self.state.generators() {
                    for instance in &record.instances {
                        if let Err(err) = self.schedule(instance) {
                            error!(
                                instance = %instance.instance_name(),
                                error = %err,
                                "Failed to resume generator"
                            );
                        }
                    }
                }
            }
        }
    }

    async fn add_generator(
        &self,
        entry: &Value,
        timestamp: Option<&str>,
    ) -> Result<String, CollectorError> {
        let mut generator = Generator::from_value(entry)?;
        prepare_context(&mut generator, timestamp)?;

        if self.state.contains_generator(&generator.name) {
            debug!(generator = %generator.name, "Added generator already known; replacing");
        }
        let name = generator.name.clone();
        self.install(generator).await?;
        Ok(name)
    }

    async fn update_generator(
        &self,
        entry: &Value,
        timestamp: Option<&str>,
    ) -> Result<String, CollectorError> {
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| CollectorError::validation("generator update has no name"))?;

        let Some(existing) = self.state.generator(name) else {
            debug!(generator = %name, "Update for unknown generator; adding it");
            return self.add_generator(entry, timestamp).await;
        };

        let mut merged = existing.definition.merge(entry)?;
        if entry.get("context").is_some() {
            prepare_context(&mut merged, timestamp)?;
        } else {
            apply_defaults(&mut merged);
        }

        self.install(merged).await?;
        Ok(name.to_string())
    }

    async fn delete_generator(&self, name: &str) {
        let Some(record) = self.state.remove_generator(name) else {
            debug!(generator = %name, "Delete for unknown generator");
            return;
        };
        for instance in record.instance_names() {
            self.repeater.stop(&instance);
            self.queues.dispose(&instance).await;
        }
        info!(generator = %name, "Deleted generator");
    }

    /// Replace whatever is scheduled for `generator.name` with fresh instances.
    async fn install(&self, generator: Generator) -> Result<(), CollectorError> {
        let instances = self.instances_for(&generator).await?;
        let new_names: HashSet<String> = instances.iter().map(Generator::instance_name).collect();

        if let Some(previous) = self.state.generator(&generator.name) {
            for instance in previous.instance_names() {
                self.repeater.stop(&instance);
                if !new_names.contains(&instance) {
                    self.queues.dispose(&instance).await;
                }
            }
        }

        let runtime = self.state.runtime();
        let target = self.delivery_for(&generator);
        for instance in &instances {
            let config = queue_config(instance, &runtime, &target);
            if let Some(existing) = self.queues.get(&config.name)
                && existing.target() != &config.target
            {
                self.queues.dispose(&config.name).await;
            }
            self.queues.create(config)?;
        }

        let running = runtime.status == CollectorStatus::Running;
        if running {
            for instance in &instances {
                self.schedule(instance)?;
            }
        }

        debug!(
            generator = %generator.name,
            instances = instances.len(),
            scheduled = running,
            "Installed generator"
        );
        self.state.set_generator(GeneratorRecord {
            definition: generator,
            instances,
        });
        Ok(())
    }

    /// Bulk generators run as one instance; others fan out to one per subject.
    async fn instances_for(&self, generator: &Generator) -> Result<Vec<Generator>, CollectorError> {
        if generator.is_bulk() {
            let subjects = match (&generator.subjects, &generator.subject) {
                (Some(subjects), _) => subjects.clone(),
                (None, Some(subject)) => vec![subject.clone()],
                (None, None) => Vec::new(),
            };
            return Ok(vec![generator.with_subjects(subjects)]);
        }

        let subjects = match (&generator.subjects, &generator.subject, &generator.subject_query) {
            (Some(subjects), _, _) => subjects.clone(),
            (None, Some(subject), _) => vec![subject.clone()],
            (None, None, Some(query)) => self.collector.discover_subjects(query).await?,
            (None, None, None) => Vec::new(),
        };
        if subjects.is_empty() {
            warn!(generator = %generator.name, "Generator has no subjects");
        }
        Ok(generator.fan_out(&subjects))
    }

    fn delivery_for(&self, generator: &Generator) -> DeliveryTarget {
        match generator.token.as_deref().filter(|token| !token.is_empty()) {
            Some(token) => DeliveryTarget {
                token: token.to_string(),
                ..self.delivery.clone()
            },
            None => self.delivery.clone(),
        }
    }

    fn schedule(&self, instance: &Generator) -> Result<(), CollectorError> {
        let collector = self.collector.clone();
        let generator = Arc::new(instance.clone());
        let task = task_fn(move || {
            let collector = collector.clone();
            let generator = generator.clone();
            async move { collector.collect(&generator).await }
        });

        let spec = RepeatSpec::new(instance.instance_name(), instance.interval(), task)
            .on_progress(Arc::new(|name: &str, report: &CollectionReport| {
                debug!(
                    instance = %name,
                    samples = report.samples,
                    failed = report.error.is_some(),
                    "Generator run complete"
                );
            }))
            .on_failure(Arc::new(|name: &str, err: &CollectorError| {
                error!(instance = %name, error = %err, "Generator run failed");
            }));
        self.repeater.start(spec)
    }
}

fn queue_config(
    instance: &Generator,
    runtime: &CollectorRuntimeConfig,
    target: &DeliveryTarget,
) -> QueueConfig {
    QueueConfig {
        name: instance.instance_name(),
        size: runtime.max_samples_per_bulk_request,
        flush_timeout: runtime.queue_flush_timeout(),
        target: target.clone(),
    }
}

/// The entries of a generator section, or `None` (logged) when it is absent or malformed.
fn section<'a>(
    value: &'a Option<Value>,
    label: &str,
    report: &mut ReconcileReport,
) -> Option<&'a Vec<Value>> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::Array(entries)) => Some(entries),
        Some(other) => {
            report.skipped += 1;
            warn!(section = label, value = %other, "Heartbeat section is not an array; skipping");
            None
        }
    }
}
