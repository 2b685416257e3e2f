//! Heartbeat exchange with the control plane and reconciliation of its
//! responses into scheduled work.

pub mod client;
pub mod reconciler;

pub use client::HeartbeatClient;
pub use reconciler::{HeartbeatReconciler, ReconcileReport};
