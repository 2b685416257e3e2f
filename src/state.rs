//! Live collector state.
//!
//! One [`LiveState`] is built per process and shared by handle. It owns the
//! runtime configuration last merged from heartbeats and the table of known
//! generators together with the instances (fan-out clones) currently
//! scheduled for each.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::{CollectorRuntimeConfig, CollectorStatus};
use crate::models::Generator;

/// A known generator and the instances derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorRecord {
    /// Definition as received and merged from heartbeats.
    pub definition: Generator,
    /// One entry per scheduled repeat/queue: a single bulk instance or one
    /// clone per subject.
    pub instances: Vec<Generator>,
}

impl GeneratorRecord {
    pub fn instance_names(&self) -> Vec<String> {
        self.instances.iter().map(Generator::instance_name).collect()
    }
}

#[derive(Debug)]
pub struct LiveState {
    collector_name: String,
    runtime: RwLock<CollectorRuntimeConfig>,
    generators: RwLock<HashMap<String, GeneratorRecord>>,
}

impl LiveState {
    pub fn new<S: Into<String>>(collector_name: S, runtime: CollectorRuntimeConfig) -> Self {
        Self {
            collector_name: collector_name.into(),
            runtime: RwLock::new(runtime),
            generators: RwLock::new(HashMap::new()),
        }
    }

    pub fn collector_name(&self) -> &str {
        &self.collector_name
    }

    pub fn runtime(&self) -> CollectorRuntimeConfig {
        self.runtime.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn status(&self) -> CollectorStatus {
        self.runtime.read().unwrap_or_else(|e| e.into_inner()).status
    }

    /// Replace the runtime configuration, returning the previous one.
    pub fn set_runtime(&self, runtime: CollectorRuntimeConfig) -> CollectorRuntimeConfig {
        let mut guard = self.runtime.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, runtime)
    }

    pub fn generator(&self, name: &str) -> Option<GeneratorRecord> {
        self.generators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn contains_generator(&self, name: &str) -> bool {
        self.generators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn generators(&self) -> Vec<GeneratorRecord> {
        let mut records: Vec<GeneratorRecord> = self
            .generators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
        records
    }

    /// Insert or replace the record keyed by its definition name.
    pub fn set_generator(&self, record: GeneratorRecord) -> Option<GeneratorRecord> {
        self.generators
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.definition.name.clone(), record)
    }

    pub fn remove_generator(&self, name: &str) -> Option<GeneratorRecord> {
        self.generators
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    pub fn clear_generators(&self) {
        self.generators
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
