//! # Data Models
//!
//! Wire and in-memory models shared by the collector components.

use serde::{Deserialize, Serialize};

pub mod generator;
pub mod heartbeat;
pub mod sample;

pub use generator::{
    Aspect, Connection, ContextDefinition, Generator, GeneratorTemplate, Subject, Transform,
};
pub use heartbeat::{DeletedGenerator, HeartbeatRequest, HeartbeatResponse};
pub use sample::Sample;

/// Collector identification reported to the control plane with each heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorInfo {
    /// The version of the collector
    pub version: String,
    /// Operating system the collector runs on
    #[serde(rename = "osInfo")]
    pub os_info: OsInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsInfo {
    pub platform: String,
    pub arch: String,
}

impl Default for CollectorInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            os_info: OsInfo {
                platform: std::env::consts::OS.to_string(),
                arch: std::env::consts::ARCH.to_string(),
            },
        }
    }
}
