//! # Collector Library
//!
//! A data-collection agent for Refocus: it heartbeats with the control plane,
//! schedules generators, fetches and transforms remote data in a sandbox, and
//! delivers samples through buffered bulk upserts.

pub mod agent;
pub mod collect;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod heartbeat;
pub mod models;
pub mod queue;
pub mod repeater;
pub mod sandbox;
pub mod state;
pub mod telemetry;
pub mod upsert;
pub mod validation;
