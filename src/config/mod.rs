//! Configuration loading for the collector.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `COLLECTOR_`, producing a typed [`AppConfig`]. The control plane can later
//! adjust the live [`CollectorRuntimeConfig`] through heartbeats.

use std::{collections::BTreeMap, env, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

use crate::error::CollectorError;

/// Environment variable prefix for every collector setting.
const ENV_PREFIX: &str = "COLLECTOR_";

/// Application configuration derived from `COLLECTOR_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub collector_name: String,
    #[serde(default)]
    pub refocus_url: String,
    #[serde(default)]
    pub refocus_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refocus_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_proxy: Option<String>,
    #[serde(default = "default_sandbox_timeout_ms")]
    pub sandbox_timeout_ms: u64,
    #[serde(default = "default_remote_request_timeout_secs")]
    pub remote_request_timeout_secs: u64,
    #[serde(default = "default_bulk_upsert_max_retry_secs")]
    pub bulk_upsert_max_retry_secs: u64,
    #[serde(default)]
    pub runtime: CollectorRuntimeConfig,
}

/// Collector status directive sent by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CollectorStatus {
    #[default]
    Running,
    Paused,
    Stopped,
}

/// Live collector settings, shallow-merged from heartbeat `collectorConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorRuntimeConfig {
    #[serde(default)]
    pub status: CollectorStatus,
    #[serde(default = "default_heartbeat_interval_millis")]
    pub heartbeat_interval_millis: u64,
    #[serde(default = "default_max_samples_per_bulk_request")]
    pub max_samples_per_bulk_request: usize,
    #[serde(default = "default_sample_upsert_queue_time_millis")]
    pub sample_upsert_queue_time_millis: u64,
    /// Keys the collector does not interpret are retained verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for CollectorRuntimeConfig {
    fn default() -> Self {
        Self {
            status: CollectorStatus::default(),
            heartbeat_interval_millis: default_heartbeat_interval_millis(),
            max_samples_per_bulk_request: default_max_samples_per_bulk_request(),
            sample_upsert_queue_time_millis: default_sample_upsert_queue_time_millis(),
            extra: Map::new(),
        }
    }
}

impl CollectorRuntimeConfig {
    /// Shallow-merge `patch` onto this config key by key.
    ///
    /// Unknown keys are kept in `extra`. A key whose value would make the
    /// config invalid is left out and returned with its error; the other
    /// keys still apply.
    pub fn merged(&self, patch: &Map<String, Value>) -> (Self, Vec<(String, CollectorError)>) {
        let mut merged = self.clone();
        let mut rejected = Vec::new();

        for (key, value) in patch {
            let mut candidate = match serde_json::to_value(&merged) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            };
            candidate.insert(key.clone(), value.clone());

            let applied = serde_json::from_value::<CollectorRuntimeConfig>(Value::Object(candidate))
                .map_err(|err| {
                    CollectorError::validation(format!("invalid collectorConfig.{key}: {err}"))
                })
                .and_then(|candidate| candidate.validate().map(|()| candidate));
            match applied {
                Ok(candidate) => merged = candidate,
                Err(err) => rejected.push((key.clone(), err)),
            }
        }

        (merged, rejected)
    }

    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.heartbeat_interval_millis == 0 {
            return Err(CollectorError::validation(
                "heartbeatIntervalMillis must be a positive number",
            ));
        }
        if self.max_samples_per_bulk_request == 0 {
            return Err(CollectorError::validation(
                "maxSamplesPerBulkRequest must be a positive number",
            ));
        }
        if self.sample_upsert_queue_time_millis == 0 {
            return Err(CollectorError::validation(
                "sampleUpsertQueueTimeMillis must be a positive number",
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_millis)
    }

    pub fn queue_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_upsert_queue_time_millis)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            collector_name: String::new(),
            refocus_url: String::new(),
            refocus_token: String::new(),
            refocus_proxy: None,
            data_source_proxy: None,
            sandbox_timeout_ms: default_sandbox_timeout_ms(),
            remote_request_timeout_secs: default_remote_request_timeout_secs(),
            bulk_upsert_max_retry_secs: default_bulk_upsert_max_retry_secs(),
            runtime: CollectorRuntimeConfig::default(),
        }
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.refocus_token.is_empty() {
            config.refocus_token = "[REDACTED]".to_string();
        }
        if config.refocus_proxy.is_some() {
            config.refocus_proxy = Some("[REDACTED]".to_string());
        }
        if config.data_source_proxy.is_some() {
            config.data_source_proxy = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_millis(self.sandbox_timeout_ms)
    }

    pub fn remote_request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_request_timeout_secs)
    }

    pub fn bulk_upsert_max_retry(&self) -> Duration {
        Duration::from_secs(self.bulk_upsert_max_retry_secs)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collector_name.trim().is_empty() {
            return Err(ConfigError::MissingCollectorName);
        }
        if self.refocus_url.trim().is_empty() {
            return Err(ConfigError::MissingRefocusUrl);
        }
        if let Err(source) = Url::parse(&self.refocus_url) {
            return Err(ConfigError::InvalidRefocusUrl {
                value: self.refocus_url.clone(),
                source,
            });
        }
        if self.refocus_token.trim().is_empty() {
            return Err(ConfigError::MissingRefocusToken);
        }
        if self.sandbox_timeout_ms == 0 || self.sandbox_timeout_ms > 10_000 {
            return Err(ConfigError::InvalidSandboxTimeout {
                value: self.sandbox_timeout_ms,
            });
        }
        if self.remote_request_timeout_secs == 0 {
            return Err(ConfigError::InvalidRemoteRequestTimeout {
                value: self.remote_request_timeout_secs,
            });
        }
        if self.bulk_upsert_max_retry_secs == 0 {
            return Err(ConfigError::InvalidBulkUpsertMaxRetry {
                value: self.bulk_upsert_max_retry_secs,
            });
        }
        self.runtime
            .validate()
            .map_err(|err| ConfigError::InvalidRuntime {
                message: err.to_string(),
            })?;
        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_sandbox_timeout_ms() -> u64 {
    300
}

fn default_remote_request_timeout_secs() -> u64 {
    30
}

fn default_bulk_upsert_max_retry_secs() -> u64 {
    60
}

fn default_heartbeat_interval_millis() -> u64 {
    15_000
}

fn default_max_samples_per_bulk_request() -> usize {
    1_000
}

fn default_sample_upsert_queue_time_millis() -> u64 {
    15_000
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("configuration file not found: {path}")]
    EnvFileNotFound { path: PathBuf },
    #[error("collector name is missing; set COLLECTOR_COLLECTOR_NAME")]
    MissingCollectorName,
    #[error("refocus url is missing; set COLLECTOR_REFOCUS_URL")]
    MissingRefocusUrl,
    #[error("invalid refocus url '{value}': {source}")]
    InvalidRefocusUrl {
        value: String,
        source: url::ParseError,
    },
    #[error("refocus token is missing; set COLLECTOR_REFOCUS_TOKEN")]
    MissingRefocusToken,
    #[error("sandbox timeout must be between 1 and 10000 milliseconds, got {value}")]
    InvalidSandboxTimeout { value: u64 },
    #[error("remote request timeout must be positive, got {value}")]
    InvalidRemoteRequestTimeout { value: u64 },
    #[error("bulk upsert max retry must be positive, got {value}")]
    InvalidBulkUpsertMaxRetry { value: u64 },
    #[error("invalid runtime configuration: {message}")]
    InvalidRuntime { message: String },
}

impl From<ConfigError> for CollectorError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::EnvFileNotFound { path } => {
                CollectorError::resource_not_found(format!("{}", path.display()))
            }
            other => CollectorError::validation(other.to_string()),
        }
    }
}

/// Loads configuration using layered `.env` files and `COLLECTOR_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
    explicit_file: Option<PathBuf>,
    collector_name: Option<String>,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            explicit_file: None,
            collector_name: None,
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            explicit_file: None,
            collector_name: None,
        }
    }

    /// Adds an env file that must exist; it is applied after the layered files.
    pub fn with_env_file(mut self, path: PathBuf) -> Self {
        self.explicit_file = Some(path);
        self
    }

    /// Overrides the collector name from every other source.
    pub fn with_collector_name<S: Into<String>>(mut self, name: S) -> Self {
        self.collector_name = Some(name.into());
        self
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_non_empty(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let log_level = take_non_empty(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format =
            take_non_empty(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let collector_name = self
            .collector_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| take_non_empty(&mut layered, "COLLECTOR_NAME"))
            .or_else(|| take_non_empty(&mut layered, "NAME"))
            .unwrap_or_default();
        let refocus_url = take_non_empty(&mut layered, "REFOCUS_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_default();
        let refocus_token = take_non_empty(&mut layered, "REFOCUS_TOKEN").unwrap_or_default();
        let refocus_proxy = take_non_empty(&mut layered, "REFOCUS_PROXY");
        let data_source_proxy = take_non_empty(&mut layered, "DATA_SOURCE_PROXY");
        let sandbox_timeout_ms = take_parsed(&mut layered, "SANDBOX_TIMEOUT_MS")
            .unwrap_or_else(default_sandbox_timeout_ms);
        let remote_request_timeout_secs = take_parsed(&mut layered, "REMOTE_REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(default_remote_request_timeout_secs);
        let bulk_upsert_max_retry_secs = take_parsed(&mut layered, "BULK_UPSERT_MAX_RETRY_SECS")
            .unwrap_or_else(default_bulk_upsert_max_retry_secs);

        let runtime = CollectorRuntimeConfig {
            status: CollectorStatus::Running,
            heartbeat_interval_millis: take_parsed(&mut layered, "HEARTBEAT_INTERVAL_MILLIS")
                .unwrap_or_else(default_heartbeat_interval_millis),
            max_samples_per_bulk_request: take_parsed(&mut layered, "MAX_SAMPLES_PER_BULK_REQUEST")
                .unwrap_or_else(default_max_samples_per_bulk_request),
            sample_upsert_queue_time_millis: take_parsed(
                &mut layered,
                "SAMPLE_UPSERT_QUEUE_TIME_MILLIS",
            )
            .unwrap_or_else(default_sample_upsert_queue_time_millis),
            extra: Map::new(),
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            collector_name,
            refocus_url,
            refocus_token,
            refocus_proxy,
            data_source_proxy,
            sandbox_timeout_ms,
            remote_request_timeout_secs,
            bulk_upsert_max_retry_secs,
            runtime,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("COLLECTOR_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        if let Some(path) = &self.explicit_file {
            if !path.exists() {
                return Err(ConfigError::EnvFileNotFound { path: path.clone() });
            }
            self.merge_dotenv(path.clone(), &mut values)?;
        }

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_non_empty(values: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    values
        .remove(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn take_parsed<T: std::str::FromStr>(values: &mut BTreeMap<String, String>, key: &str) -> Option<T> {
    values.remove(key).and_then(|value| value.trim().parse().ok())
}
